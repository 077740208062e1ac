//! Accept loop.
//!
//! Each accepted TCP link becomes a serving [`Channel`]; each stream the
//! peer opens on it is dispatched to the [`TetherService`] on its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{Channel, TetherError};

use crate::service::TetherService;

pub struct Server {
    listener: TcpListener,
    service: Arc<TetherService>,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs, service: Arc<TetherService>) -> Result<Self, TetherError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn service(&self) -> &Arc<TetherService> {
        &self.service
    }

    /// Cancelling this token stops the accept loop and closes every link.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept links until shut down.
    pub async fn run(self) -> Result<(), TetherError> {
        info!("listening on {}", self.listener.local_addr()?);
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {e}");
            }

            info!(%peer, "client connected");
            let service = self.service.clone();
            let shutdown = self.shutdown.child_token();
            tokio::spawn(serve_link(stream, peer, service, shutdown));
        }
        info!("server stopped");
        Ok(())
    }
}

async fn serve_link(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    service: Arc<TetherService>,
    shutdown: CancellationToken,
) {
    let peer = peer.to_string();
    let (channel, mut incoming) = Channel::server(stream, peer.clone());
    loop {
        let call = tokio::select! {
            _ = shutdown.cancelled() => break,
            call = incoming.recv() => call,
        };
        // The reader task drops the sender once the link is gone.
        let Some(call) = call else { break };
        let service = service.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            service.handle(&peer, call).await;
        });
    }
    channel.close();
    info!(%peer, "client disconnected");
}
