//! Shared-secret authentication.
//!
//! - [`AuthGuard`] gates every incoming call on the server.
//! - [`CredentialVault`] keeps the secret encrypted at rest.
//! - [`Secret`] holds the plaintext in memory only.

mod guard;
mod vault;

pub use guard::{AUTH_HEADER, AuthGuard};
pub use vault::{CredentialVault, Secret};
