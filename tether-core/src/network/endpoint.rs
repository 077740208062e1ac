use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use super::channel::Channel;
use crate::error::TetherError;

/// Where a session connects to. Also the pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub host: String,
    pub port: u16,
    pub use_secure_transport: bool,
}

impl EndpointIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_secure_transport: false,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.use_secure_transport = secure;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_secure_transport { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Produces physical channels for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &EndpointIdentity) -> Result<Channel, TetherError>;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &EndpointIdentity) -> Result<Channel, TetherError> {
        if endpoint.use_secure_transport {
            return Err(TetherError::Unsupported(
                "secure transport must be provided by an external tunnel",
            ));
        }
        let address = endpoint.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TetherError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(%endpoint, "tcp link established");
        Ok(Channel::client(stream, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_includes_security_flag() {
        let plain = EndpointIdentity::new("localhost", 50051);
        let secure = plain.clone().secure(true);
        let set: HashSet<_> = [plain.clone(), secure.clone(), plain.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(plain.to_string(), "tcp://localhost:50051");
        assert_eq!(secure.to_string(), "tls://localhost:50051");
    }

    #[tokio::test]
    async fn secure_transport_is_rejected() {
        let endpoint = EndpointIdentity::new("127.0.0.1", 1).secure(true);
        let err = TcpConnector::default().connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, TetherError::Unsupported(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = EndpointIdentity::new("127.0.0.1", port);
        assert!(TcpConnector::default().connect(&endpoint).await.is_err());
    }
}
