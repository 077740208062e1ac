//! Logging bootstrap for the binaries.
//!
//! Stderr by default. With a log file configured, events go through a
//! non-blocking appender into a [`RotatingFileWriter`] that starts a new
//! file every `max_entries_per_file` events and prunes rotated files past
//! the retention window.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::TetherError;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub file: Option<PathBuf>,
    pub max_entries_per_file: u64,
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
            max_entries_per_file: 10_000,
            retention_days: 7,
        }
    }
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            file: config.log_file(),
            max_entries_per_file: config.max_log_entries_per_file,
            retention_days: config.max_log_retention_days,
        }
    }
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &LogConfig) -> Result<(), TetherError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = RotatingFileWriter::open(path, config.max_entries_per_file, config.retention_days)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TetherError::Config(format!("failed to install logger: {e}")))?;
    let _ = GUARD.set(guard);
    Ok(())
}

// ── RotatingFileWriter ───────────────────────────────────────────

/// Appends to `path`, rotating it aside after a fixed number of entries.
///
/// Rotated files are named `<file name>.<unix seconds>-<sequence>` in the
/// same directory.
#[derive(Debug)]
pub struct RotatingFileWriter {
    path: PathBuf,
    file: File,
    entries: u64,
    max_entries: u64,
    retention: Option<Duration>,
    sequence: u64,
}

impl RotatingFileWriter {
    pub fn open(path: &Path, max_entries: u64, retention_days: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let entries = match std::fs::read(path) {
            Ok(existing) => count_entries(&existing),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        let writer = Self {
            path: path.to_path_buf(),
            file: open_append(path)?,
            entries,
            max_entries: max_entries.max(1),
            retention: (retention_days > 0).then(|| Duration::from_secs(retention_days * 24 * 60 * 60)),
            sequence: 0,
        };
        writer.prune_at(SystemTime::now())?;
        Ok(writer)
    }

    /// Entries written to the current file.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.sequence += 1;
        let rotated = self.path.with_file_name(format!("{}.{secs}-{}", self.file_name(), self.sequence));
        std::fs::rename(&self.path, &rotated)?;
        self.file = open_append(&self.path)?;
        self.entries = 0;
        self.prune_at(SystemTime::now())?;
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Delete rotated files last modified before `now - retention`.
    pub fn prune_at(&self, now: SystemTime) -> io::Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let Some(cutoff) = now.checked_sub(retention) else {
            return Ok(0);
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!("{}.", self.file_name());

        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.entries >= self.max_entries {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.entries += count_entries(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn count_entries(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("tether.log."))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rotates_after_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.log");
        let mut writer = RotatingFileWriter::open(&path, 2, 7).unwrap();
        for i in 0..5 {
            writeln!(writer, "event {i}").unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(rotated_files(dir.path()).len(), 2);
        assert_eq!(writer.entries(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "event 4\n");
    }

    #[test]
    fn existing_entries_count_toward_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.log");
        std::fs::write(&path, "a\nb\n").unwrap();
        let mut writer = RotatingFileWriter::open(&path, 2, 7).unwrap();
        writeln!(writer, "c").unwrap();
        assert_eq!(rotated_files(dir.path()).len(), 1);
    }

    #[test]
    fn prunes_rotated_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.log");
        let mut writer = RotatingFileWriter::open(&path, 1, 7).unwrap();
        writeln!(writer, "one").unwrap();
        writeln!(writer, "two").unwrap();
        assert_eq!(rotated_files(dir.path()).len(), 1);

        let now = SystemTime::now();
        assert_eq!(writer.prune_at(now).unwrap(), 0);
        let later = now + Duration::from_secs(8 * 24 * 60 * 60);
        assert_eq!(writer.prune_at(later).unwrap(), 1);
        assert!(rotated_files(dir.path()).is_empty());
        assert!(path.exists());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RotatingFileWriter::open(&dir.path().join("tether.log"), 1, 0).unwrap();
        let far = SystemTime::now() + Duration::from_secs(365 * 24 * 60 * 60);
        assert_eq!(writer.prune_at(far).unwrap(), 0);
    }
}
