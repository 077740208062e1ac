use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tracing::debug;

use super::vault::Secret;
use crate::protocol::call::{CallMetadata, Status};

/// Metadata header carrying the base64-encoded shared secret.
pub const AUTH_HEADER: &str = "x-tether-auth";

/// Server-side gate run before any handler logic.
#[derive(Debug, Clone)]
pub struct AuthGuard {
    expected: Option<Secret>,
}

impl AuthGuard {
    /// Require `secret` on every call.
    pub fn new(secret: Secret) -> Self {
        Self::from_secret(Some(secret))
    }

    /// Accept every call.
    pub fn open() -> Self {
        Self { expected: None }
    }

    /// An empty secret is treated as none configured.
    pub fn from_secret(secret: Option<Secret>) -> Self {
        Self {
            expected: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.expected.is_none()
    }

    /// Check the auth header of one call.
    pub fn check(&self, metadata: &CallMetadata) -> Result<(), Status> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        let header = metadata
            .get(AUTH_HEADER)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Status::unauthenticated("missing auth header"))?;
        let presented = BASE64
            .decode(header)
            .map_err(|_| Status::unauthenticated("malformed auth header"))?;
        if constant_time_eq(&presented, expected.as_bytes()) {
            Ok(())
        } else {
            debug!("auth header did not match");
            Err(Status::unauthenticated("invalid credentials"))
        }
    }
}

impl Secret {
    /// Value for the [`AUTH_HEADER`] metadata field.
    pub fn header_value(&self) -> String {
        BASE64.encode(self.as_bytes())
    }

    /// Attach the auth header to `metadata`.
    pub fn authorize(&self, metadata: &mut CallMetadata) {
        metadata.insert(AUTH_HEADER, self.header_value());
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
