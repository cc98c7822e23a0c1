//! Decoded packet model and re-encoding

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::{Magic, Opcode, HEADER_LEN};
use crate::error::FrameError;

/// Response status: key not found
pub const STATUS_KEY_ENOENT: u16 = 0x0001;

/// A memcached binary packet
///
/// Body segments are `Bytes` so decoded packets share the connection buffer.
/// The total body length is not stored; it is always derived from the segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: Opcode,
    /// Absent when the frame carries no key
    pub key: Option<Bytes>,
    pub extras: Bytes,
    pub value: Bytes,
    pub data_type: u8,
    /// vbucket id on requests, status code on responses
    pub status_or_vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
}

impl Packet {
    fn empty(magic: Magic, opcode: Opcode, status_or_vbucket: u16) -> Self {
        Self {
            magic,
            opcode,
            key: None,
            extras: Bytes::new(),
            value: Bytes::new(),
            data_type: 0,
            status_or_vbucket,
            opaque: 0,
            cas: 0,
        }
    }

    /// Build an empty request packet
    pub fn request(opcode: Opcode) -> Self {
        Self::empty(Magic::Request, opcode, 0)
    }

    /// Build an empty response packet with the given status
    pub fn response(opcode: Opcode, status: u16) -> Self {
        Self::empty(Magic::Response, opcode, status)
    }

    /// Build a response answering `request`, echoing its opcode and opaque
    pub fn reply_to(request: &Packet, status: u16) -> Self {
        Self::response(request.opcode, status).with_opaque(request.opaque)
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        let key = key.into();
        self.key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Raw key bytes, if the packet carries a key
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Key decoded as UTF-8 (lossy), empty when absent
    pub fn key_str(&self) -> String {
        self.key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }

    /// Key as text when valid UTF-8, hex otherwise
    pub fn key_display(&self) -> String {
        display_bytes(self.key().unwrap_or_default())
    }

    pub fn is_request(&self) -> bool {
        self.magic == Magic::Request
    }

    /// vbucket id, only meaningful on requests
    pub fn vbucket(&self) -> Option<u16> {
        self.is_request().then_some(self.status_or_vbucket)
    }

    /// Status code, only meaningful on responses
    pub fn status(&self) -> Option<u16> {
        (!self.is_request()).then_some(self.status_or_vbucket)
    }

    fn key_len(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len())
    }

    /// extras + key + value
    pub fn total_body_len(&self) -> usize {
        self.extras.len() + self.key_len() + self.value.len()
    }

    /// Length of the packet on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.total_body_len()
    }

    /// Encode the packet to wire bytes, recomputing all length fields
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let key_len = u16::try_from(self.key_len()).map_err(|_| {
            FrameError::EncodeMismatch(format!("key length {} exceeds u16", self.key_len()))
        })?;
        let extras_len = u8::try_from(self.extras.len()).map_err(|_| {
            FrameError::EncodeMismatch(format!(
                "extras length {} exceeds u8",
                self.extras.len()
            ))
        })?;
        let body_len = u32::try_from(self.total_body_len()).map_err(|_| {
            FrameError::EncodeMismatch(format!(
                "body length {} exceeds u32",
                self.total_body_len()
            ))
        })?;

        let expected = self.encoded_len();
        let mut buf = BytesMut::with_capacity(expected);
        buf.put_u8(self.magic as u8);
        buf.put_u8(self.opcode.code());
        buf.put_u16(key_len);
        buf.put_u8(extras_len);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status_or_vbucket);
        buf.put_u32(body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.extend_from_slice(&self.extras);
        if let Some(key) = &self.key {
            buf.extend_from_slice(key);
        }
        buf.extend_from_slice(&self.value);

        if buf.len() != expected {
            return Err(FrameError::EncodeMismatch(format!(
                "encoded {} bytes, declared {}",
                buf.len(),
                expected
            )));
        }
        Ok(buf.freeze())
    }
}

/// Bytes as text when valid UTF-8, hex otherwise
pub fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(bytes),
    }
}
