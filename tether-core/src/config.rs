//! Application configuration shared by the server and client binaries.
//!
//! Stored as a camelCase JSON document. Relative paths resolve against the
//! directory the configuration file lives in (the base directory).

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{CredentialVault, Secret};
use crate::chunk::clamp_chunk_size;
use crate::error::TetherError;
use crate::network::EndpointIdentity;
use crate::protocol::transfer::DEFAULT_CHUNK_SIZE;

/// Top-level configuration loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Server bind address / client target host.
    pub host: String,
    pub port: u16,
    /// Chunk size for every chunked transfer. Clamped to 1 B ..= 4 MiB.
    pub max_chunk_size_bytes: usize,
    /// Root directory served by download and list.
    pub storage_root: String,
    /// Log level filter: "trace", "debug", "info", "warn", "error".
    pub log_level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub log_file_path: String,
    pub max_log_entries_per_file: u64,
    pub max_log_retention_days: u64,
    /// Delete broadcast files received during a session when it closes.
    pub auto_delete_received_files: bool,
    /// Where the client saves broadcast files.
    pub client_download_path: String,
    /// Upload directory beneath the storage root. Empty means the root.
    pub server_upload_path: String,
    /// Shared secret sealed by the credential vault.
    pub encrypted_secret: Option<String>,

    #[serde(skip)]
    base_dir: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 50051,
            max_chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            storage_root: "storage".into(),
            log_level: "info".into(),
            log_file_path: String::new(),
            max_log_entries_per_file: 10_000,
            max_log_retention_days: 7,
            auto_delete_received_files: false,
            client_download_path: "downloads".into(),
            server_upload_path: String::new(),
            encrypted_secret: None,
            base_dir: PathBuf::from("."),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(TetherError::Connection(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default().with_base_dir(base_dir_of(path))
            }
            Err(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default().with_base_dir(base_dir_of(path))
            }
        }
    }

    /// Load configuration from a JSON file, reporting any failure.
    pub fn try_load(path: &Path) -> Result<Self, TetherError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config.with_base_dir(base_dir_of(path)).normalized())
    }

    /// Persist this configuration with normalized paths.
    pub fn save(&self, path: &Path) -> Result<(), TetherError> {
        let mut config = self.clone();
        config.base_dir = base_dir_of(path);
        let config = config.normalized();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, config.to_json_pretty()?)?;
        Ok(())
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> Result<(), TetherError> {
        Self::default().save(path)
    }

    pub fn to_json_pretty(&self) -> Result<String, TetherError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Clamp the chunk size and rewrite every path with `/` separators,
    /// relative to the base directory when beneath it.
    pub fn normalized(mut self) -> Self {
        let clamped = clamp_chunk_size(self.max_chunk_size_bytes);
        if clamped != self.max_chunk_size_bytes {
            warn!(
                configured = self.max_chunk_size_bytes,
                using = clamped,
                "maxChunkSizeBytes out of range"
            );
            self.max_chunk_size_bytes = clamped;
        }
        let base = self.base_dir.clone();
        for path in [
            &mut self.storage_root,
            &mut self.log_file_path,
            &mut self.client_download_path,
            &mut self.server_upload_path,
        ] {
            *path = normalize_path(path, &base);
        }
        self
    }

    // ── Derived values ───────────────────────────────────────────

    pub fn chunk_size(&self) -> usize {
        clamp_chunk_size(self.max_chunk_size_bytes)
    }

    pub fn endpoint(&self) -> EndpointIdentity {
        EndpointIdentity::new(self.host.clone(), self.port)
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn storage_root_path(&self) -> PathBuf {
        self.resolve(&self.storage_root)
    }

    /// Where uploads land: the upload path beneath the storage root.
    pub fn upload_dir(&self) -> PathBuf {
        self.storage_root_path().join(&self.server_upload_path)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.resolve(&self.client_download_path)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        (!self.log_file_path.is_empty()).then(|| self.resolve(&self.log_file_path))
    }

    // ── Secret ───────────────────────────────────────────────────

    /// Decrypt the configured secret, if any.
    pub fn secret(&self, vault: &CredentialVault) -> Result<Option<Secret>, TetherError> {
        self.encrypted_secret
            .as_deref()
            .filter(|record| !record.is_empty())
            .map(|record| vault.open(record))
            .transpose()
    }

    /// Seal `secret` into the configuration. The plaintext is not kept.
    pub fn set_secret(&mut self, vault: &CredentialVault, secret: &Secret) -> Result<(), TetherError> {
        self.encrypted_secret = Some(vault.seal(secret)?);
        Ok(())
    }
}

fn base_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Rewrite `path` with `/` separators, relative to `base` when beneath it.
pub fn normalize_path(path: &str, base: &Path) -> String {
    if path.is_empty() {
        return String::new();
    }
    let unified = path.replace('\\', "/");
    let candidate = Path::new(&unified);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(base).unwrap_or(candidate)
    } else {
        candidate
    };

    let mut parts: Vec<String> = Vec::new();
    let mut rooted = false;
    for component in relative.components() {
        match component {
            Component::RootDir => rooted = true,
            Component::Prefix(prefix) => parts.push(prefix.as_os_str().to_string_lossy().into_owned()),
            Component::CurDir => {}
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if rooted { format!("/{joined}") } else { joined }
}

// ── Tests ────────────────────────────────────────────────────────
