//! RPC dispatch.
//!
//! Every incoming call passes the [`AuthGuard`] first; a rejected call is
//! finished with `Unauthenticated` before any handler runs. Handlers end
//! the stream with a status derived from their result.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::chunk;
use tether_core::{
    AppConfig, AuthGuard, ByteAck, ByteMessage, CredentialVault, DownloadRequest, IncomingCall,
    JsonAck, JsonEnvelope, ListRequest, ListResponse, Method, ScreenshotRequest, Status, StatusCode,
    StreamReceiver, StreamSender, SubscribeRequest, TetherError, TransferChunk, UploadStatus,
};

use crate::events::ServerEvent;
use crate::files::{FileStore, UploadError};
use crate::hub::{BroadcastHub, SubscriptionKind};
use crate::screen::{ScreenSource, SyntheticScreen};

pub struct TetherService {
    hub: Arc<BroadcastHub>,
    files: FileStore,
    screen: Arc<dyn ScreenSource>,
    guard: AuthGuard,
    chunk_size: usize,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl TetherService {
    pub fn new(hub: Arc<BroadcastHub>, files: FileStore, guard: AuthGuard) -> Self {
        Self {
            hub,
            files,
            screen: Arc::new(SyntheticScreen::default()),
            guard,
            chunk_size: tether_core::protocol::DEFAULT_CHUNK_SIZE,
            events: None,
        }
    }

    /// Build the service described by `config`, opening its sealed secret.
    pub fn from_config(config: &AppConfig, vault: &CredentialVault) -> Result<Self, TetherError> {
        let guard = AuthGuard::from_secret(config.secret(vault)?);
        if guard.is_open() {
            warn!("no shared secret configured; every call is accepted");
        }
        let hub = Arc::new(BroadcastHub::new(config.chunk_size()));
        Ok(Self::new(hub, FileStore::from_config(config), guard).with_chunk_size(config.chunk_size()))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk::clamp_chunk_size(chunk_size);
        self
    }

    pub fn with_screen(mut self, screen: Arc<dyn ScreenSource>) -> Self {
        self.screen = screen;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Serve one call to completion.
    pub async fn handle(&self, peer: &str, call: IncomingCall) {
        let IncomingCall { method, metadata, stream } = call;
        let (tx, mut rx) = stream.split();

        if let Err(status) = self.guard.check(&metadata) {
            warn!(%peer, %method, reason = %status.message, "rejected unauthenticated call");
            let _ = tx.finish(status).await;
            return;
        }
        debug!(%peer, %method, stream_id = tx.stream_id(), "call accepted");

        let result = match method {
            Method::JsonStream => self.json_stream(peer, &tx, &mut rx).await,
            Method::JsonDuplex => self.json_duplex(peer, &tx, &mut rx).await,
            Method::Upload => self.upload(peer, &tx, &mut rx).await,
            Method::Download => self.download(&tx, &mut rx).await,
            Method::ListFiles => self.list(&tx, &mut rx).await,
            Method::Screenshot => self.screenshot(&tx, &mut rx).await,
            Method::SubscribeFiles => self.subscribe(SubscriptionKind::Files, peer, &tx, &mut rx).await,
            Method::SubscribeBytes => self.subscribe(SubscriptionKind::Bytes, peer, &tx, &mut rx).await,
            Method::SendBytes => self.send_bytes(peer, &tx, &mut rx, true).await,
            Method::SendBytesNoAck => self.send_bytes(peer, &tx, &mut rx, false).await,
        };

        let status = match result {
            Ok(()) => Status::ok(),
            Err(e) => {
                debug!(%peer, %method, error = %e, "call failed");
                status_for(e)
            }
        };
        if let Err(e) = tx.finish(status).await {
            debug!(%peer, %method, error = %e, "could not finish call");
        }
    }

    // ── JSON ─────────────────────────────────────────────────────

    fn accept_envelope(&self, peer: &str, envelope: JsonEnvelope) -> JsonAck {
        if envelope.is_probe() {
            return JsonAck::success(envelope.id);
        }
        match envelope.parse() {
            Ok(_) => {
                debug!(%peer, kind = %envelope.kind, id = %envelope.id, "json received");
                let ack = JsonAck::success(envelope.id.clone());
                self.emit(ServerEvent::JsonReceived {
                    peer: peer.to_string(),
                    envelope,
                });
                ack
            }
            Err(e) => {
                warn!(%peer, id = %envelope.id, error = %e, "rejected malformed json");
                JsonAck::failure(envelope.id, format!("invalid json: {e}"))
            }
        }
    }

    async fn json_stream(&self, peer: &str, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        while let Some(envelope) = rx.recv::<JsonEnvelope>().await? {
            let ack = self.accept_envelope(peer, envelope);
            tx.send(&ack).await?;
        }
        Ok(())
    }

    async fn json_duplex(&self, peer: &str, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        let id = self.hub.register_json(peer, Box::new(tx.clone()));
        self.joined(SubscriptionKind::Json, id, peer);

        loop {
            match rx.recv::<JsonEnvelope>().await {
                // Duplex envelopes are logged, never acked.
                Ok(Some(envelope)) => {
                    let ack = self.accept_envelope(peer, envelope);
                    if !ack.success {
                        debug!(%peer, id = %ack.id, "duplex envelope dropped");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer, error = %e, "duplex stream ended");
                    break;
                }
            }
        }

        self.left(SubscriptionKind::Json, id);
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────

    async fn upload(&self, peer: &str, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        match self.files.receive_upload(rx).await {
            Ok(stored) => {
                self.emit(ServerEvent::UploadCompleted {
                    peer: peer.to_string(),
                    path: stored.path.clone(),
                    size: stored.size,
                });
                tx.send(&UploadStatus::completed(stored.path)).await
            }
            Err(UploadError { path, error }) => {
                warn!(%peer, path = path.as_deref().unwrap_or("-"), %error, "upload failed");
                self.emit(ServerEvent::UploadFailed {
                    peer: peer.to_string(),
                    path: path.clone(),
                    error: error.to_string(),
                });
                if error.is_transport() {
                    return Err(error);
                }
                tx.send(&UploadStatus::failed(path.unwrap_or_default(), error.to_string()))
                    .await
            }
        }
    }

    async fn download(&self, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        let request: DownloadRequest = required(rx).await?;
        self.files.send_download(&request.path, tx).await?;
        Ok(())
    }

    async fn list(&self, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        let request: ListRequest = required(rx).await?;
        let files = self.files.list(&request.directory).await.map_err(TetherError::Status)?;
        tx.send(&ListResponse { files }).await
    }

    async fn screenshot(&self, tx: &StreamSender, rx: &mut StreamReceiver) -> Result<(), TetherError> {
        let request: ScreenshotRequest = required(rx).await?;
        let name = format!("screen-{}.bmp", request.monitor_index);
        match self.screen.capture(request.monitor_index).await {
            Ok(image) => {
                for piece in chunk::split(&name, &image, self.chunk_size) {
                    tx.send(&piece).await?;
                }
                debug!(monitor = request.monitor_index, size = image.len(), "screenshot sent");
            }
            Err(e) => {
                warn!(monitor = request.monitor_index, error = %e, "screen capture failed");
                tx.send(&TransferChunk::failed(name, e.to_string())).await?;
            }
        }
        Ok(())
    }

    // ── Push subscriptions ───────────────────────────────────────

    /// Register the caller for file or byte pushes until it goes away.
    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        peer: &str,
        tx: &StreamSender,
        rx: &mut StreamReceiver,
    ) -> Result<(), TetherError> {
        let label = match rx.recv::<SubscribeRequest>().await {
            Ok(Some(request)) if !request.client_name.is_empty() => format!("{}@{peer}", request.client_name),
            Ok(Some(_)) => peer.to_string(),
            Ok(None) | Err(_) => return Ok(()),
        };

        let id = match kind {
            SubscriptionKind::Files => self.hub.register_files(label.clone(), Box::new(tx.clone())),
            SubscriptionKind::Bytes => self.hub.register_bytes(label.clone(), Box::new(tx.clone())),
            SubscriptionKind::Json => self.hub.register_json(label.clone(), Box::new(tx.clone())),
        };
        self.joined(kind, id, &label);

        rx.closed().await;

        self.left(kind, id);
        Ok(())
    }

    fn joined(&self, kind: SubscriptionKind, id: u64, label: &str) {
        info!(%kind, id, %label, "subscriber joined");
        self.emit(ServerEvent::SubscriberJoined {
            kind,
            id,
            label: label.to_string(),
        });
    }

    fn left(&self, kind: SubscriptionKind, id: u64) {
        // A failed push may already have removed the handle.
        self.hub.unregister(kind, id);
        info!(%kind, id, "subscriber left");
        self.emit(ServerEvent::SubscriberLeft { kind, id });
    }

    // ── Bytes ────────────────────────────────────────────────────

    async fn send_bytes(
        &self,
        peer: &str,
        tx: &StreamSender,
        rx: &mut StreamReceiver,
        ack: bool,
    ) -> Result<(), TetherError> {
        let message: ByteMessage = required(rx).await?;
        debug!(%peer, kind = %message.kind, size = message.data.len(), "bytes received");
        let id = message.id.clone();
        self.emit(ServerEvent::BytesReceived {
            peer: peer.to_string(),
            message,
        });
        if ack {
            tx.send(&ByteAck::success(id)).await?;
        }
        Ok(())
    }
}

/// The single request message of a unary call.
async fn required<T: serde::de::DeserializeOwned>(rx: &mut StreamReceiver) -> Result<T, TetherError> {
    rx.recv::<T>()
        .await?
        .ok_or_else(|| TetherError::Status(Status::invalid_argument("missing request message")))
}

/// Map a handler failure onto the status that ends the call.
pub fn status_for(error: TetherError) -> Status {
    match error {
        TetherError::Status(status) => status,
        TetherError::Cancelled => Status::cancelled("call cancelled"),
        TetherError::InvalidPath(path) => Status::invalid_argument(format!("invalid path: {path}")),
        TetherError::Encoding(e) => Status::invalid_argument(format!("undecodable message: {e}")),
        e if e.is_transport() => Status::new(StatusCode::Unavailable, e.to_string()),
        e => Status::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(TetherError::Status(Status::not_found("x"))).code,
            StatusCode::NotFound
        );
        assert_eq!(status_for(TetherError::InvalidPath("..".into())).code, StatusCode::InvalidArgument);
        assert_eq!(status_for(TetherError::ChannelClosed).code, StatusCode::Unavailable);
        assert_eq!(status_for(TetherError::Other("boom".into())).code, StatusCode::Internal);
    }
}
