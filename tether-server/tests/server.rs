//! Server integration tests over real TCP: the auth gate, file calls and
//! broadcast pushes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_core::chunk::{self, Assembled, ChunkAssembler};
use tether_core::{
    AUTH_HEADER, AuthGuard, CallMetadata, Channel, Connector, DownloadRequest, EndpointIdentity,
    JsonAck, JsonEnvelope, ListRequest, ListResponse, Method, Secret, StatusCode, SubscribeRequest,
    TcpConnector, TetherError, TransferChunk, UploadStatus,
};
use tether_server::{BroadcastHub, FileStore, Server, ServerEvent, SubscriptionKind, TetherService};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Harness ──────────────────────────────────────────────────────

struct Running {
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    storage: TempDir,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: CancellationToken,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(secret: Option<&str>) -> Running {
    let storage = tempfile::tempdir().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let hub = Arc::new(BroadcastHub::new(64 * 1024));
    let service = TetherService::new(
        hub.clone(),
        FileStore::new(storage.path(), "", 64 * 1024),
        AuthGuard::from_secret(secret.map(Secret::from)),
    )
    .with_events(events_tx);

    let server = Server::bind("127.0.0.1:0", Arc::new(service)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());
    Running {
        addr,
        hub,
        storage,
        events,
        shutdown,
    }
}

async fn connect(addr: SocketAddr) -> Channel {
    let endpoint = EndpointIdentity::new(addr.ip().to_string(), addr.port());
    TcpConnector::default().connect(&endpoint).await.unwrap()
}

fn authorized(secret: &str) -> CallMetadata {
    let mut metadata = CallMetadata::new();
    Secret::from(secret).authorize(&mut metadata);
    metadata
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn wait_for_subscribers(hub: &BroadcastHub, kind: SubscriptionKind, count: usize) {
    within(async {
        while hub.subscriber_count(kind) != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

async fn upload(channel: &Channel, metadata: &CallMetadata, name: &str, data: &[u8]) -> Result<Option<UploadStatus>, TetherError> {
    let (tx, mut rx) = channel.open(Method::Upload, metadata).await?.split();
    for piece in chunk::split(name, data, 64 * 1024) {
        // The server may already have refused the call.
        if tx.send(&piece).await.is_err() {
            break;
        }
    }
    rx.recv::<UploadStatus>().await
}

// ── Auth ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_calls_have_no_side_effects() {
    let mut server = start(Some("s3cret")).await;
    let channel = connect(server.addr).await;

    let missing = CallMetadata::new();
    let empty = CallMetadata::new().with(AUTH_HEADER, "");
    let off_by_one = authorized("s3creu");

    for (metadata, name) in [(missing, "a.bin"), (empty, "b.bin"), (off_by_one, "c.bin")] {
        let err = within(upload(&channel, &metadata, name, b"payload")).await.unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::Unauthenticated), "{name}");
        assert!(!server.storage.path().join(name).exists());
    }
    assert!(server.events.try_recv().is_err());

    let status = within(upload(&channel, &authorized("s3cret"), "ok.bin", b"payload"))
        .await
        .unwrap()
        .unwrap();
    assert!(status.success);
    assert!(server.storage.path().join("ok.bin").exists());
}

// ── Files ────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_download_and_list_roundtrip() {
    let mut server = start(None).await;
    let channel = connect(server.addr).await;
    let metadata = CallMetadata::new();
    let original: Vec<u8> = (0..250 * 1024u32).map(|i| (i * 7 % 251) as u8).collect();

    let status = within(upload(&channel, &metadata, "dir/report.bin", &original))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, UploadStatus::completed("report.bin"));
    match within(server.events.recv()).await.unwrap() {
        ServerEvent::UploadCompleted { path, size, .. } => {
            assert_eq!(path, "report.bin");
            assert_eq!(size, original.len() as u64);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let (tx, mut rx) = channel.open(Method::Download, &metadata).await.unwrap().split();
    tx.send_last(&DownloadRequest { path: "report.bin".into() }).await.unwrap();
    let mut assembler = ChunkAssembler::new();
    let mut percents = Vec::new();
    let mut downloaded = None;
    while let Some(piece) = within(rx.recv::<TransferChunk>()).await.unwrap() {
        let assembled = assembler.accept(piece);
        percents.extend(assembled.percent());
        if let Assembled::Complete { data, .. } = assembled {
            downloaded = Some(data);
        }
    }
    assert_eq!(percents, vec![25, 50, 75, 100]);
    assert_eq!(downloaded.unwrap().as_ref(), original.as_slice());

    let (tx, mut rx) = channel.open(Method::ListFiles, &metadata).await.unwrap().split();
    tx.send_last(&ListRequest { directory: String::new() }).await.unwrap();
    let listing: ListResponse = within(rx.recv()).await.unwrap().unwrap();
    assert_eq!(listing.files, vec!["report.bin"]);
}

#[tokio::test]
async fn missing_download_yields_error_chunk() {
    let server = start(None).await;
    let channel = connect(server.addr).await;

    let (tx, mut rx) = channel.open(Method::Download, &CallMetadata::new()).await.unwrap().split();
    tx.send_last(&DownloadRequest { path: "nothing.here".into() }).await.unwrap();
    let piece: TransferChunk = within(rx.recv()).await.unwrap().unwrap();
    assert!(piece.is_error() && piece.is_last);
    assert!(within(rx.recv::<TransferChunk>()).await.unwrap().is_none());
}

#[tokio::test]
async fn listing_outside_the_root_is_refused() {
    let server = start(None).await;
    let channel = connect(server.addr).await;

    let (tx, mut rx) = channel.open(Method::ListFiles, &CallMetadata::new()).await.unwrap().split();
    tx.send_last(&ListRequest { directory: "../".into() }).await.unwrap();
    let err = within(rx.recv::<ListResponse>()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::InvalidArgument));
}

#[tokio::test]
async fn malformed_json_is_acked_as_failure() {
    let server = start(None).await;
    let channel = connect(server.addr).await;

    let (tx, mut rx) = channel.open(Method::JsonStream, &CallMetadata::new()).await.unwrap().split();
    tx.send(&JsonEnvelope::with_id("good", "t", r#"{"a":1}"#)).await.unwrap();
    tx.send(&JsonEnvelope::with_id("bad", "t", "{a:")).await.unwrap();
    tx.close_send().await.unwrap();

    let first: JsonAck = within(rx.recv()).await.unwrap().unwrap();
    let second: JsonAck = within(rx.recv()).await.unwrap().unwrap();
    assert!(first.success && first.id == "good");
    assert!(!second.success && second.id == "bad");
    assert!(second.error.is_some());
}

// ── Broadcast ────────────────────────────────────────────────────

async fn subscribe_files(channel: &Channel, name: &str) -> tether_core::StreamReceiver {
    let (tx, rx) = channel
        .open(Method::SubscribeFiles, &CallMetadata::new())
        .await
        .unwrap()
        .split();
    tx.send(&SubscribeRequest { client_name: name.into() }).await.unwrap();
    rx
}

#[tokio::test]
async fn file_broadcast_reaches_every_subscriber() {
    let server = start(None).await;
    let alpha = connect(server.addr).await;
    let beta = connect(server.addr).await;
    let mut alpha_rx = subscribe_files(&alpha, "alpha").await;
    let mut beta_rx = subscribe_files(&beta, "beta").await;
    wait_for_subscribers(&server.hub, SubscriptionKind::Files, 2).await;

    let payload = vec![42u8; 150 * 1024];
    let report = server.hub.broadcast_payload("notice.bin", &payload).await;
    assert_eq!(report.to_string(), "reached 2 of 2 subscribers");

    for rx in [&mut alpha_rx, &mut beta_rx] {
        let mut assembler = ChunkAssembler::new();
        loop {
            let piece: TransferChunk = within(rx.recv()).await.unwrap().unwrap();
            if let Assembled::Complete { path, data } = assembler.accept(piece) {
                assert_eq!(path, "notice.bin");
                assert_eq!(data.len(), payload.len());
                break;
            }
        }
    }

    // A departed subscriber is dropped from the registry.
    beta.close();
    wait_for_subscribers(&server.hub, SubscriptionKind::Files, 1).await;
    let report = server.hub.broadcast_payload("again.bin", b"x").await;
    assert_eq!((report.attempted, report.reached), (1, 1));
}
