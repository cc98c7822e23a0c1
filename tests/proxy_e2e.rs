//! Loopback TCP: client -> interceptor -> fake memcached backend

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use memd_interceptor::business::{KeyCounter, KeyCounts, ReplyNotFound};
use memd_interceptor::config::ConnConfig;
use memd_interceptor::core::packet::STATUS_KEY_ENOENT;
use memd_interceptor::core::{
    Direction, Dispatcher, FrameDecoder, HookRegistry, Magic, Opcode, OpcodeFilter, Packet, Server,
};
use memd_interceptor::server_runner::{bind_listener, serve};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Read one whole frame off `stream`
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Packet> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).await?;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut buf = BytesMut::with_capacity(24 + body_len);
    buf.put_slice(&header);
    buf.resize(24 + body_len, 0);
    stream.read_exact(&mut buf[24..]).await?;
    FrameDecoder::default()
        .decode(&mut buf)
        .map(|frame| frame.packet)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Answers every GET with value "bar", reports each request it sees
async fn fake_backend(listener: TcpListener, seen: mpsc::UnboundedSender<Packet>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let seen = seen.clone();
        tokio::spawn(async move {
            while let Ok(request) = read_frame(&mut stream).await {
                let response = Packet::reply_to(&request, 0)
                    .with_extras(Bytes::from_static(&[0, 0, 0, 0]))
                    .with_value(Bytes::from_static(b"bar"));
                let _ = seen.send(request);
                let Ok(wire) = response.encode() else { break };
                if stream.write_all(&wire).await.is_err() {
                    break;
                }
            }
        });
    }
}

struct Harness {
    proxy_addr: std::net::SocketAddr,
    backend_seen: mpsc::UnboundedReceiver<Packet>,
    shutdown: CancellationToken,
}

async fn start(registry: HookRegistry) -> Harness {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let (seen_tx, backend_seen) = mpsc::unbounded_channel();
    tokio::spawn(fake_backend(backend, seen_tx));

    let server = Arc::new(
        Server::builder()
            .dispatcher(Arc::new(Dispatcher::new(Arc::new(registry))))
            .conn_config(ConnConfig::default())
            .backend(backend_addr.to_string())
            .build()
            .unwrap(),
    );
    let listener = bind_listener("127.0.0.1:0", 64).unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, server, shutdown.clone()));

    Harness {
        proxy_addr,
        backend_seen,
        shutdown,
    }
}

fn get(key: &'static str, opaque: u32) -> Bytes {
    Packet::request(Opcode::Get)
        .with_key(key)
        .with_opaque(opaque)
        .encode()
        .unwrap()
}

#[tokio::test]
async fn client_sees_backend_responses_through_the_proxy() {
    let counts = Arc::new(KeyCounts::new());
    let mut registry = HookRegistry::new();
    registry.register(
        Direction::Request,
        OpcodeFilter::Exact(Opcode::Get),
        Arc::new(KeyCounter::new(Arc::clone(&counts))),
    );
    let mut harness = start(registry).await;

    let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
    for opaque in 1..=2 {
        client.write_all(&get("foo", opaque)).await.unwrap();
        let response = tokio::time::timeout(TIMEOUT, read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.magic, Magic::Response);
        assert_eq!(response.opaque, opaque);
        assert_eq!(response.status(), Some(0));
        assert_eq!(&response.value[..], b"bar");
    }

    assert_eq!(counts.get("foo"), 2);
    let first = harness.backend_seen.recv().await.unwrap();
    assert_eq!(first.key_str(), "foo");
    assert_eq!(first.opaque, 1);

    harness.shutdown.cancel();
}

#[tokio::test]
async fn replies_never_reach_the_backend() {
    let mut registry = HookRegistry::new();
    registry.register(
        Direction::Request,
        OpcodeFilter::Exact(Opcode::Delete),
        Arc::new(ReplyNotFound),
    );
    let mut harness = start(registry).await;

    let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let delete = Packet::request(Opcode::Delete)
        .with_key("foo")
        .with_opaque(7)
        .encode()
        .unwrap();
    let mut batch = BytesMut::new();
    batch.extend_from_slice(&delete);
    batch.extend_from_slice(&get("foo", 8));
    client.write_all(&batch).await.unwrap();

    // Replies and backend responses may interleave; collect both
    let mut responses = Vec::new();
    for _ in 0..2 {
        let response = tokio::time::timeout(TIMEOUT, read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        responses.push(response);
    }
    responses.sort_by_key(|p| p.opaque);

    assert_eq!(responses[0].opcode, Opcode::Delete);
    assert_eq!(responses[0].status(), Some(STATUS_KEY_ENOENT));
    assert_eq!(responses[1].opcode, Opcode::Get);
    assert_eq!(&responses[1].value[..], b"bar");

    // Only the GET made it to the backend
    let seen = harness.backend_seen.recv().await.unwrap();
    assert_eq!(seen.opcode, Opcode::Get);
    assert!(harness.backend_seen.try_recv().is_err());

    harness.shutdown.cancel();
}

#[tokio::test]
async fn invalid_magic_closes_the_client_connection() {
    let harness = start(HookRegistry::new()).await;

    let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
    client.write_all(&[0u8; 24]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    harness.shutdown.cancel();
}
