//! Per-direction connection pipeline
//!
//! Decodes frames off one stream, dispatches each through the hook chain and
//! hands the outcome to the outbound channel before the next frame is decoded,
//! so output order always matches input order.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::dispatch::{DispatchMeta, DispatchResult, Dispatcher, DropReason};
use super::hooks::{ConnectionId, Direction, Peer, StatsCollector};
use super::protocol::{Frame, FrameDecoder};
use crate::error::{FrameError, ProxyError};
use crate::logger::log;

/// Bytes queued for one end of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub peer: Peer,
    pub bytes: Bytes,
}

/// Decode state owned by one pipeline
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Bytes received but not yet decoded into a frame
    buf: BytesMut,
    /// Sequence number of the next decoded packet
    next_seq: u64,
}

impl ConnectionState {
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn packets_seen(&self) -> u64 {
        self.next_seq
    }
}

/// Counters for one finished pipeline
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub packets: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub replied: u64,
    pub failed: u64,
}

pub struct Pipeline {
    conn_id: ConnectionId,
    direction: Direction,
    decoder: FrameDecoder,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<dyn StatsCollector>,
    state: ConnectionState,
    summary: PipelineSummary,
}

impl Pipeline {
    pub fn new(
        conn_id: ConnectionId,
        direction: Direction,
        decoder: FrameDecoder,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<dyn StatsCollector>,
    ) -> Self {
        Self {
            conn_id,
            direction,
            decoder,
            dispatcher,
            stats,
            state: ConnectionState::default(),
            summary: PipelineSummary::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn summary(&self) -> PipelineSummary {
        self.summary
    }

    /// Append `chunk` and process every complete frame now buffered.
    ///
    /// Returns the number of frames processed. A fatal framing error stops
    /// processing; nothing from the faulty frame is queued.
    pub async fn ingest(
        &mut self,
        chunk: &[u8],
        out: &mpsc::Sender<Outbound>,
    ) -> Result<usize, ProxyError> {
        self.state.buf.extend_from_slice(chunk);
        let mut processed = 0;

        loop {
            let frame = match self.decoder.decode(&mut self.state.buf) {
                Ok(frame) => frame,
                Err(FrameError::IncompleteFrame { .. }) => return Ok(processed),
                Err(e) => {
                    log::framing(self.conn_id, self.direction, &e);
                    return Err(e.into());
                }
            };
            self.process(frame, out).await?;
            processed += 1;
        }
    }

    async fn process(&mut self, frame: Frame, out: &mpsc::Sender<Outbound>) -> Result<(), ProxyError> {
        let seq = self.state.next_seq;
        self.state.next_seq += 1;
        self.summary.packets += 1;

        let opcode = frame.packet.opcode;
        let meta = DispatchMeta {
            conn_id: self.conn_id,
            direction: self.direction,
            seq,
        };
        let result = self.dispatcher.dispatch(frame.packet, meta).await;

        let outbound = match result {
            // Unmodified packets go out as the exact bytes received
            DispatchResult::Forward(_) => Some((self.direction.forward_peer(), Ok(frame.raw))),
            DispatchResult::ForwardModified(packet) => {
                Some((self.direction.forward_peer(), packet.encode()))
            }
            DispatchResult::Reply(packet) => Some((self.direction.reply_peer(), packet.encode())),
            DispatchResult::Drop(reason) => {
                if matches!(reason, DropReason::HookFailure(_)) {
                    self.summary.failed += 1;
                    self.stats.record_failed(self.direction, opcode);
                } else {
                    self.summary.dropped += 1;
                    self.stats.record_dropped(self.direction, opcode);
                }
                None
            }
        };

        let Some((peer, encoded)) = outbound else {
            return Ok(());
        };

        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    conn_id = self.conn_id,
                    direction = %self.direction,
                    seq = seq,
                    opcode = %opcode,
                    error = %e,
                    "Failed to encode hook output, dropping packet"
                );
                self.summary.failed += 1;
                self.stats.record_failed(self.direction, opcode);
                return Ok(());
            }
        };

        let len = bytes.len() as u64;
        out.send(Outbound { peer, bytes })
            .await
            .map_err(|_| ProxyError::Closed("outbound writer stopped".into()))?;

        if peer == self.direction.forward_peer() {
            self.summary.forwarded += 1;
            self.stats.record_forwarded(self.direction, opcode, len);
        } else {
            self.summary.replied += 1;
            self.stats.record_replied(self.direction, opcode);
        }
        Ok(())
    }

    /// Read `reader` to EOF, feeding every chunk through `ingest`.
    ///
    /// Returns the summary on clean EOF, the first fatal error otherwise.
    pub async fn run<R>(
        mut self,
        mut reader: R,
        out: mpsc::Sender<Outbound>,
        buffer_size: usize,
    ) -> Result<PipelineSummary, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut temp_buf = vec![0u8; buffer_size];
        loop {
            let n = reader.read(&mut temp_buf).await?;
            if n == 0 {
                if self.state.buffered() > 0 {
                    log::debug!(
                        conn_id = self.conn_id,
                        direction = %self.direction,
                        pending = self.state.buffered(),
                        "Stream closed with a truncated frame"
                    );
                }
                return Ok(self.summary);
            }
            self.ingest(&temp_buf[..n], &out).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::{HookAction, HookContext, NoopStats, OpcodeFilter, PacketHook};
    use crate::core::packet::Packet;
    use crate::core::protocol::Opcode;
    use crate::core::registry::HookRegistry;
    use async_trait::async_trait;

    struct DropKey(&'static str);

    #[async_trait]
    impl PacketHook for DropKey {
        fn name(&self) -> &str {
            "drop-key"
        }

        async fn on_packet(
            &self,
            packet: &Packet,
            _ctx: &HookContext<'_>,
        ) -> anyhow::Result<HookAction> {
            if packet.key() == Some(self.0.as_bytes()) {
                Ok(HookAction::Drop)
            } else {
                Ok(HookAction::Pass)
            }
        }
    }

    struct Upper;

    #[async_trait]
    impl PacketHook for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn on_packet(
            &self,
            packet: &Packet,
            _ctx: &HookContext<'_>,
        ) -> anyhow::Result<HookAction> {
            let key = packet.key_str().to_uppercase();
            Ok(HookAction::ForwardModified(packet.clone().with_key(key)))
        }
    }

    struct Oversized;

    #[async_trait]
    impl PacketHook for Oversized {
        fn name(&self) -> &str {
            "oversized"
        }

        async fn on_packet(
            &self,
            packet: &Packet,
            _ctx: &HookContext<'_>,
        ) -> anyhow::Result<HookAction> {
            Ok(HookAction::ForwardModified(
                packet.clone().with_extras(vec![0u8; 256]),
            ))
        }
    }

    fn pipeline(registry: HookRegistry) -> Pipeline {
        Pipeline::new(
            1,
            Direction::Request,
            FrameDecoder::default(),
            Arc::new(Dispatcher::new(Arc::new(registry))),
            Arc::new(NoopStats),
        )
    }

    fn get(key: &str) -> Bytes {
        Packet::request(Opcode::Get)
            .with_key(key.to_string())
            .encode()
            .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_forward_is_byte_identical() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(HookRegistry::new());

        let wire = get("foo");
        assert_eq!(p.ingest(&wire, &tx).await.unwrap(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                peer: Peer::Server,
                bytes: wire
            }]
        );
    }

    #[tokio::test]
    async fn test_split_frame_across_chunks() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(HookRegistry::new());

        let wire = get("split-key");
        assert_eq!(p.ingest(&wire[..7], &tx).await.unwrap(), 0);
        assert_eq!(p.state().buffered(), 7);
        assert_eq!(p.ingest(&wire[7..], &tx).await.unwrap(), 1);
        assert_eq!(p.state().buffered(), 0);
        assert_eq!(drain(&mut rx)[0].bytes, wire);
    }

    #[tokio::test]
    async fn test_dropped_packets_are_absent_and_order_kept() {
        let mut registry = HookRegistry::new();
        registry.register(
            Direction::Request,
            OpcodeFilter::Exact(Opcode::Get),
            Arc::new(DropKey("b")),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(registry);

        let mut chunk = Vec::new();
        for key in ["a", "b", "c", "d"] {
            chunk.extend_from_slice(&get(key));
        }
        assert_eq!(p.ingest(&chunk, &tx).await.unwrap(), 4);

        let out: Vec<Bytes> = drain(&mut rx).into_iter().map(|o| o.bytes).collect();
        assert_eq!(out, vec![get("a"), get("c"), get("d")]);
        assert_eq!(p.summary().dropped, 1);
        assert_eq!(p.summary().forwarded, 3);
        assert_eq!(p.state().packets_seen(), 4);
    }

    #[tokio::test]
    async fn test_modified_packet_is_reencoded() {
        let mut registry = HookRegistry::new();
        registry.register(Direction::Request, OpcodeFilter::Any, Arc::new(Upper));
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(registry);

        p.ingest(&get("foo"), &tx).await.unwrap();
        assert_eq!(drain(&mut rx)[0].bytes, get("FOO"));
    }

    #[tokio::test]
    async fn test_encode_mismatch_drops_and_keeps_connection() {
        let mut registry = HookRegistry::new();
        registry.register(Direction::Request, OpcodeFilter::Any, Arc::new(Oversized));
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(registry);

        let mut chunk = get("a").to_vec();
        chunk.extend_from_slice(&get("b"));
        assert_eq!(p.ingest(&chunk, &tx).await.unwrap(), 2);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(p.summary().failed, 2);
    }

    #[tokio::test]
    async fn test_invalid_magic_forwards_nothing_after_fault() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut p = pipeline(HookRegistry::new());

        let mut chunk = get("ok").to_vec();
        chunk.push(0x00);
        chunk.extend_from_slice(&[0u8; 30]);

        let err = p.ingest(&chunk, &tx).await.unwrap_err();
        assert!(matches!(err, ProxyError::Frame(FrameError::InvalidMagic(0))));
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, get("ok"));
    }

    #[tokio::test]
    async fn test_run_reads_until_eof() {
        let (tx, mut rx) = mpsc::channel(16);
        let p = pipeline(HookRegistry::new());

        let mut wire = get("x").to_vec();
        wire.extend_from_slice(&get("y"));
        let summary = p.run(&wire[..], tx, 5).await.unwrap();

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.forwarded, 2);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_closed_writer_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut p = pipeline(HookRegistry::new());
        assert!(matches!(
            p.ingest(&get("x"), &tx).await,
            Err(ProxyError::Closed(_))
        ));
    }
}
