//! Integration tests: channel lifecycle, stream round-trips, pooling and
//! failure scenarios over a real TCP connection on localhost.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{
    CallMetadata, Channel, ChannelPool, Connector, EndpointIdentity, IncomingCall, JsonAck,
    JsonEnvelope, Method, PoolConfig, Status, StatusCode, TcpConnector, TetherError,
    TransferChunk, chunk,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

// ── Helpers ──────────────────────────────────────────────────────

/// Bind on an OS-assigned port and return the endpoint to dial.
async fn ephemeral_listener() -> (TcpListener, EndpointIdentity) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, EndpointIdentity::new(addr.ip().to_string(), addr.port()))
}

/// Accept one link and wrap it as the serving side.
async fn accept(listener: &TcpListener) -> (Channel, mpsc::UnboundedReceiver<IncomingCall>) {
    let (stream, peer) = listener.accept().await.unwrap();
    Channel::server(stream, peer.to_string())
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

// ── Stream round-trips ───────────────────────────────────────────

#[tokio::test]
async fn test_ack_stream_roundtrip_over_tcp() {
    let (listener, endpoint) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (channel, mut incoming) = accept(&listener).await;
        let call = incoming.recv().await.unwrap();
        assert_eq!(call.method, Method::JsonStream);
        let (tx, mut rx) = call.stream.split();
        while let Some(env) = rx.recv::<JsonEnvelope>().await.unwrap() {
            tx.send(&JsonAck::success(env.id)).await.unwrap();
        }
        tx.finish(Status::ok()).await.unwrap();
        channel
    });

    let client = TcpConnector::default().connect(&endpoint).await.unwrap();
    let (tx, mut rx) = client
        .open(Method::JsonStream, &CallMetadata::new())
        .await
        .unwrap()
        .split();

    let sent: Vec<JsonEnvelope> = (0..10)
        .map(|i| JsonEnvelope::new("counter", format!("{{\"n\":{i}}}")))
        .collect();
    for env in &sent {
        tx.send(env).await.unwrap();
    }
    tx.close_send().await.unwrap();

    let mut acked = Vec::new();
    while let Some(ack) = within(rx.recv::<JsonAck>()).await.unwrap() {
        assert!(ack.success);
        acked.push(ack.id);
    }
    let expected: Vec<String> = sent.into_iter().map(|e| e.id).collect();
    assert_eq!(acked, expected);
    within(server).await.unwrap();
}

#[tokio::test]
async fn test_chunked_payload_crosses_the_link() {
    let (listener, endpoint) = ephemeral_listener().await;
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (channel, mut incoming) = accept(&listener).await;
        let call = incoming.recv().await.unwrap();
        let (tx, _rx) = call.stream.split();
        for piece in chunk::split("blob.bin", &payload, 64 * 1024) {
            tx.send(&piece).await.unwrap();
        }
        tx.finish(Status::ok()).await.unwrap();
        channel
    });

    let client = TcpConnector::default().connect(&endpoint).await.unwrap();
    let (_tx, mut rx) = client
        .open(Method::Download, &CallMetadata::new())
        .await
        .unwrap()
        .split();

    let mut assembler = chunk::ChunkAssembler::new();
    let mut result = None;
    while let Some(piece) = within(rx.recv::<TransferChunk>()).await.unwrap() {
        if let chunk::Assembled::Complete { data, .. } = assembler.accept(piece) {
            result = Some(data);
        }
    }
    assert_eq!(result.unwrap().as_ref(), expected.as_slice());
    within(server).await.unwrap();
}

// ── Error scenarios ──────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    use tether_core::{FrameCodec, Frame, FrameFlags, FrameHeader, FrameKind};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    let (listener, endpoint) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (channel, incoming) = accept(&listener).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(incoming);
        channel
    });

    let stream = tokio::net::TcpStream::connect(endpoint.address()).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    let header = FrameHeader::new(FrameKind::Open, FrameFlags::empty(), 0xdead, 1, 0);
    framed
        .send(Frame::from_parts(header, bytes::Bytes::new()).unwrap())
        .await
        .unwrap();

    loop {
        let frame = within(framed.next()).await.unwrap().unwrap();
        if frame.kind() == FrameKind::Heartbeat {
            continue;
        }
        assert_eq!(frame.kind(), FrameKind::Status);
        let status: Status = bincode::deserialize(frame.payload()).unwrap();
        assert_eq!(status.code, StatusCode::Unimplemented);
        break;
    }
    server.abort();
}

#[tokio::test]
async fn test_server_drop_closes_client_streams() {
    let (listener, endpoint) = ephemeral_listener().await;
    let client_task = tokio::spawn(async move {
        let client = TcpConnector::default().connect(&endpoint).await.unwrap();
        let stream = client
            .open(Method::SubscribeFiles, &CallMetadata::new())
            .await
            .unwrap();
        (client, stream)
    });

    let (server, mut incoming) = accept(&listener).await;
    let _call = within(incoming.recv()).await.unwrap();
    let (client, stream) = client_task.await.unwrap();

    server.close();
    drop(server);

    let (_tx, mut rx) = stream.split();
    let err = within(rx.recv::<TransferChunk>()).await.unwrap_err();
    assert!(matches!(err, TetherError::ChannelClosed));
    within(client.closed()).await;
    assert!(client.is_closed());
}

// ── Pooling ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_pool_reuses_tcp_link() {
    let (listener, endpoint) = ephemeral_listener().await;
    let accepted = tokio::spawn(async move {
        let mut links = Vec::new();
        while let Ok(Ok((stream, peer))) =
            tokio::time::timeout(Duration::from_millis(750), listener.accept()).await
        {
            links.push(Channel::server(stream, peer.to_string()));
        }
        links.len()
    });

    let pool = Arc::new(ChannelPool::new(
        Arc::new(TcpConnector::default()),
        PoolConfig::default(),
    ));
    let a = pool.get_or_create(&endpoint).await.unwrap();
    let b = pool.get_or_create(&endpoint).await.unwrap();
    assert_eq!(pool.ref_count(&endpoint), Some(2));
    assert!(!a.is_closed() && !b.is_closed());

    pool.release(&endpoint);
    pool.release(&endpoint);
    pool.shutdown();
    assert!(a.is_closed());

    assert_eq!(accepted.await.unwrap(), 1);
}
