//! Memcached binary protocol framing
//!
//! Implements the fixed 24-byte header format:
//! - magic (1), opcode (1), key length (2), extras length (1), data type (1)
//! - vbucket / status (2), total body length (4), opaque (4), cas (8)
//! - body: extras || key || value
//!
//! All multi-byte integers are big-endian.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

use super::packet::Packet;
use crate::error::FrameError;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 24;

/// Default upper bound for a single frame body (20MB, memcached's item limit)
pub const DEFAULT_MAX_BODY_LEN: usize = 20 * 1024 * 1024;

/// Frame magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Client request
    Request = 0x80,
    /// Server response
    Response = 0x81,
}

impl TryFrom<u8> for Magic {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Magic::Request),
            0x81 => Ok(Magic::Response),
            other => Err(FrameError::InvalidMagic(other)),
        }
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Magic::Request => write!(f, "request"),
            Magic::Response => write!(f, "response"),
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident = $code:literal => $name:literal,)+) => {
        /// Memcached binary opcode
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)+
            /// Any opcode this proxy has no name for
            Unknown(u8),
        }

        impl From<u8> for Opcode {
            fn from(value: u8) -> Self {
                match value {
                    $($code => Opcode::$variant,)+
                    other => Opcode::Unknown(other),
                }
            }
        }

        impl From<Opcode> for u8 {
            fn from(op: Opcode) -> u8 {
                match op {
                    $(Opcode::$variant => $code,)+
                    Opcode::Unknown(code) => code,
                }
            }
        }

        impl Opcode {
            /// Canonical upper-case name, `UNKNOWN` for unnamed opcodes
            pub fn name(&self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)+
                    Opcode::Unknown(_) => "UNKNOWN",
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Opcode::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Get = 0x00 => "GET",
    Set = 0x01 => "SET",
    Add = 0x02 => "ADD",
    Replace = 0x03 => "REPLACE",
    Delete = 0x04 => "DELETE",
    Increment = 0x05 => "INCREMENT",
    Decrement = 0x06 => "DECREMENT",
    Quit = 0x07 => "QUIT",
    Flush = 0x08 => "FLUSH",
    GetQ = 0x09 => "GETQ",
    Noop = 0x0a => "NOOP",
    Version = 0x0b => "VERSION",
    GetK = 0x0c => "GETK",
    GetKQ = 0x0d => "GETKQ",
    Append = 0x0e => "APPEND",
    Prepend = 0x0f => "PREPEND",
    Stat = 0x10 => "STAT",
    SetQ = 0x11 => "SETQ",
    AddQ = 0x12 => "ADDQ",
    ReplaceQ = 0x13 => "REPLACEQ",
    DeleteQ = 0x14 => "DELETEQ",
    IncrementQ = 0x15 => "INCREMENTQ",
    DecrementQ = 0x16 => "DECREMENTQ",
    QuitQ = 0x17 => "QUITQ",
    FlushQ = 0x18 => "FLUSHQ",
    AppendQ = 0x19 => "APPENDQ",
    PrependQ = 0x1a => "PREPENDQ",
    Touch = 0x1c => "TOUCH",
    Gat = 0x1d => "GAT",
    GatQ = 0x1e => "GATQ",
    Hello = 0x1f => "HELLO",
    SaslListMechs = 0x20 => "SASL_LIST_MECHS",
    SaslAuth = 0x21 => "SASL_AUTH",
    SaslStep = 0x22 => "SASL_STEP",
}

impl Opcode {
    /// Raw opcode byte
    pub fn code(&self) -> u8 {
        u8::from(*self)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Unknown(code) => write!(f, "UNKNOWN(0x{:02x})", code),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Opcode {
    type Err = String;

    /// Accepts `GET`, `get`, `CMD_GET`, `0x00` or `0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            return u8::from_str_radix(hex, 16)
                .map(Opcode::from)
                .map_err(|_| format!("invalid opcode '{}'", s));
        }
        if let Ok(code) = trimmed.parse::<u8>() {
            return Ok(Opcode::from(code));
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("CMD_").unwrap_or(&upper);
        Opcode::from_name(name).ok_or_else(|| format!("unknown opcode '{}'", s))
    }
}

/// Fixed header fields, as read off the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: Magic,
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status_or_vbucket: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parse a header from the first `HEADER_LEN` bytes of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.is_empty() {
            return Err(FrameError::IncompleteFrame {
                needed: HEADER_LEN,
                available: 0,
            });
        }
        // Checked before the length so a desynchronized stream fails fast
        let magic = Magic::try_from(buf[0])?;
        if buf.len() < HEADER_LEN {
            return Err(FrameError::IncompleteFrame {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let mut cur = &buf[1..HEADER_LEN];
        let opcode = Opcode::from(cur.get_u8());
        let key_len = cur.get_u16();
        let extras_len = cur.get_u8();
        let data_type = cur.get_u8();
        let status_or_vbucket = cur.get_u16();
        let body_len = cur.get_u32();
        let opaque = cur.get_u32();
        let cas = cur.get_u64();

        let header = Header {
            magic,
            opcode,
            key_len,
            extras_len,
            data_type,
            status_or_vbucket,
            body_len,
            opaque,
            cas,
        };
        header.check_lengths()?;
        Ok(header)
    }

    fn check_lengths(&self) -> Result<(), FrameError> {
        let extras = self.extras_len as usize;
        let key = self.key_len as usize;
        let body = self.body_len as usize;
        if extras + key > body {
            return Err(FrameError::InconsistentLength { extras, key, body });
        }
        Ok(())
    }

    /// Total frame length on the wire
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

/// A decoded packet together with the exact bytes it was decoded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet: Packet,
    /// Header and body as received, shared with the connection buffer
    pub raw: Bytes,
}

/// Incremental frame decoder for one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecoder {
    max_body_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_body_len: usize) -> Self {
        Self { max_body_len }
    }

    fn complete_header(&self, buf: &[u8]) -> Result<Header, FrameError> {
        let header = Header::parse(buf)?;
        let body = header.body_len as usize;
        if body > self.max_body_len {
            return Err(FrameError::FrameTooLarge {
                body,
                limit: self.max_body_len,
            });
        }
        if buf.len() < header.frame_len() {
            return Err(FrameError::IncompleteFrame {
                needed: header.frame_len(),
                available: buf.len(),
            });
        }
        Ok(header)
    }

    /// Decode exactly one frame from the front of `buf` (zero-copy).
    ///
    /// On success the frame's bytes are split off `buf`. On any error `buf`
    /// is left untouched.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Frame, FrameError> {
        let header = self.complete_header(buf)?;
        let frame_len = header.frame_len();

        let raw = buf.split_to(frame_len).freeze();
        let extras_end = HEADER_LEN + header.extras_len as usize;
        let key_end = extras_end + header.key_len as usize;

        let key = if header.key_len == 0 {
            None
        } else {
            Some(raw.slice(extras_end..key_end))
        };

        let packet = Packet {
            magic: header.magic,
            opcode: header.opcode,
            key,
            extras: raw.slice(HEADER_LEN..extras_end),
            value: raw.slice(key_end..frame_len),
            data_type: header.data_type,
            status_or_vbucket: header.status_or_vbucket,
            opaque: header.opaque,
            cas: header.cas,
        };

        Ok(Frame { packet, raw })
    }
}
