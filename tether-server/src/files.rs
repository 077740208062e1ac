//! File storage behind the upload, download and list calls.
//!
//! Every peer-supplied path is confined to the storage root: uploads keep
//! only the bare file name, downloads and listings refuse absolute paths
//! and `..` components.

use std::path::{Component, Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use tether_core::chunk::{self, ChunkReader};
use tether_core::{AppConfig, Status, StreamReceiver, StreamSender, TetherError, TransferChunk};

/// A completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Relative to the storage root, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// An aborted upload. `path` is set once the destination was opened.
#[derive(Debug)]
pub struct UploadError {
    pub path: Option<String>,
    pub error: TetherError,
}

pub struct FileStore {
    root: PathBuf,
    upload_dir: PathBuf,
    chunk_size: usize,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, upload_subdir: &str, chunk_size: usize) -> Self {
        let root = root.into();
        let upload_dir = match confine(upload_subdir) {
            Ok(relative) => root.join(relative),
            Err(e) => {
                warn!(error = %e, "upload path escapes the storage root, using the root");
                root.clone()
            }
        };
        Self {
            root,
            upload_dir,
            chunk_size: chunk::clamp_chunk_size(chunk_size),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.storage_root_path(), &config.server_upload_path, config.chunk_size())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Resolve a peer-supplied relative path beneath the storage root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, TetherError> {
        Ok(self.root.join(confine(relative)?))
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    // ── Upload ───────────────────────────────────────────────────

    /// Write an inbound chunk sequence to the upload directory.
    ///
    /// The destination is opened on the first chunk and finalized on the
    /// `is_last` chunk. Chunks must arrive in index order.
    pub async fn receive_upload(&self, receiver: &mut StreamReceiver) -> Result<StoredFile, UploadError> {
        let mut dest: Option<(File, String)> = None;
        let mut received: u32 = 0;
        let mut size: u64 = 0;

        loop {
            let partial = dest.as_ref().map(|(_, p)| p.clone());
            let fail = |error: TetherError| UploadError { path: partial.clone(), error };

            let chunk: TransferChunk = match receiver.recv().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err(fail(TetherError::ProtocolViolation("upload ended before its last chunk"))),
                Err(e) => return Err(fail(e)),
            };
            if let Some(error) = chunk.error {
                return Err(fail(TetherError::Remote(error)));
            }
            if chunk.index != received {
                return Err(fail(TetherError::ProtocolViolation("upload chunk out of order")));
            }

            if dest.is_none() {
                let name = bare_file_name(&chunk.path).map_err(&fail)?;
                let path = self.upload_dir.join(name);
                let opened = async {
                    tokio::fs::create_dir_all(&self.upload_dir).await?;
                    File::create(&path).await
                }
                .await;
                let shown = self.display_path(&path);
                match opened {
                    Ok(file) => {
                        debug!(path = %shown, total = chunk.total_chunks, "upload started");
                        dest = Some((file, shown));
                    }
                    Err(e) => {
                        return Err(UploadError {
                            path: Some(shown),
                            error: e.into(),
                        });
                    }
                }
            }

            let Some((file, shown)) = dest.as_mut() else {
                return Err(fail(TetherError::Other("upload destination missing".into())));
            };
            let written = file.write_all(&chunk.data).await;
            if let Err(e) = written {
                return Err(UploadError {
                    path: Some(shown.clone()),
                    error: e.into(),
                });
            }
            received += 1;
            size += chunk.data.len() as u64;

            if chunk.is_last {
                if let Err(e) = file.flush().await {
                    return Err(UploadError {
                        path: Some(shown.clone()),
                        error: e.into(),
                    });
                }
                info!(path = %shown, size, chunks = received, "upload stored");
                return Ok(StoredFile {
                    path: shown.clone(),
                    size,
                });
            }
        }
    }

    // ── Download ─────────────────────────────────────────────────

    /// Stream `requested` back as chunks. A missing or unreadable file is
    /// answered with one error-bearing chunk; only a failed write to the
    /// stream is returned as an error.
    pub async fn send_download(&self, requested: &str, sender: &StreamSender) -> Result<u32, TetherError> {
        let (file, len) = match self.open_for_download(requested).await {
            Ok(opened) => opened,
            Err(error) => {
                debug!(path = %requested, %error, "download refused");
                sender.send(&TransferChunk::failed(requested, error)).await?;
                return Ok(0);
            }
        };

        let mut reader = ChunkReader::new(file, requested, len, self.chunk_size);
        let mut sent = 0;
        loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    sender.send(&chunk).await?;
                    sent += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %requested, error = %e, "download read failed");
                    sender.send(&TransferChunk::failed(requested, e.to_string())).await?;
                    break;
                }
            }
        }
        debug!(path = %requested, size = len, chunks = sent, "download sent");
        Ok(sent)
    }

    /// Look under the storage root first, then under the upload directory,
    /// so a name reported by an upload downloads as-is.
    async fn open_for_download(&self, requested: &str) -> Result<(File, u64), String> {
        let relative = confine(requested).map_err(|e| e.to_string())?;
        let mut candidates = vec![self.root.join(&relative)];
        if self.upload_dir != self.root {
            candidates.push(self.upload_dir.join(&relative));
        }

        let mut found = None;
        for path in &candidates {
            match File::open(path).await {
                Ok(file) => {
                    found = Some(file);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
        let Some(file) = found else {
            return Err(format!("file not found: {requested}"));
        };
        let metadata = file.metadata().await.map_err(|e| e.to_string())?;
        if !metadata.is_file() {
            return Err(format!("not a file: {requested}"));
        }
        Ok((file, metadata.len()))
    }

    // ── List ─────────────────────────────────────────────────────

    /// Sorted names of the regular files in `directory`.
    pub async fn list(&self, directory: &str) -> Result<Vec<String>, Status> {
        let dir = self
            .resolve(directory)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Status::not_found(format!("directory not found: {directory}")));
            }
            Err(e) => return Err(Status::internal(e.to_string())),
        };

        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                    if is_file {
                        files.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(Status::internal(e.to_string())),
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Last component of a peer-supplied path, either separator style.
pub fn bare_file_name(path: &str) -> Result<String, TetherError> {
    let unified = path.replace('\\', "/");
    match Path::new(&unified).components().next_back() {
        Some(Component::Normal(name)) => Ok(name.to_string_lossy().into_owned()),
        _ => Err(TetherError::InvalidPath(path.to_string())),
    }
}

/// Reduce `relative` to plain components, refusing anything that could
/// leave the directory it is joined to.
fn confine(relative: &str) -> Result<PathBuf, TetherError> {
    let unified = relative.replace('\\', "/");
    let mut clean = PathBuf::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TetherError::InvalidPath(relative.to_string()));
            }
        }
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{CallMetadata, Channel, IncomingCall, Method};
    use tokio::sync::mpsc;

    fn store(dir: &Path) -> FileStore {
        FileStore::new(dir, "uploads", 4)
    }

    async fn pair() -> (Channel, Channel, mpsc::UnboundedReceiver<IncomingCall>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Channel::client(a, "server");
        let (server, incoming) = Channel::server(b, "client");
        (client, server, incoming)
    }

    #[test]
    fn bare_names_drop_directories() {
        assert_eq!(bare_file_name("a/b/report.txt").unwrap(), "report.txt");
        assert_eq!(bare_file_name("C:\\temp\\photo.png").unwrap(), "photo.png");
        assert_eq!(bare_file_name("/etc/passwd").unwrap(), "passwd");
        assert!(bare_file_name("").is_err());
        assert!(bare_file_name("..").is_err());
    }

    #[test]
    fn resolve_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.resolve("a/./b.txt").unwrap(), dir.path().join("a").join("b.txt"));
        assert_eq!(store.resolve("").unwrap(), dir.path());
        assert!(store.resolve("../outside").is_err());
        assert!(store.resolve("/etc").is_err());
        assert!(store.resolve("a\\..\\..\\b").is_err());
    }

    #[test]
    fn escaping_upload_dir_falls_back_to_root() {
        let store = FileStore::new("/srv/tether", "../elsewhere", 4);
        assert_eq!(store.upload_dir(), Path::new("/srv/tether"));
    }

    #[tokio::test]
    async fn upload_writes_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (tx, _rx) = client.open(Method::Upload, &CallMetadata::new()).await.unwrap().split();
        for chunk in chunk::split("nested/dir/hello.txt", b"hello world", 4) {
            tx.send(&chunk).await.unwrap();
        }

        let call = incoming.recv().await.unwrap();
        let (_stx, mut srx) = call.stream.split();
        let stored = store.receive_upload(&mut srx).await.unwrap();
        assert_eq!(stored, StoredFile { path: "uploads/hello.txt".into(), size: 11 });
        let on_disk = std::fs::read(dir.path().join("uploads").join("hello.txt")).unwrap();
        assert_eq!(on_disk, b"hello world");
    }

    #[tokio::test]
    async fn out_of_order_upload_aborts_with_partial_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (tx, _rx) = client.open(Method::Upload, &CallMetadata::new()).await.unwrap().split();
        let chunks = chunk::split("data.bin", b"0123456789", 4);
        tx.send(&chunks[0]).await.unwrap();
        tx.send(&chunks[2]).await.unwrap();

        let call = incoming.recv().await.unwrap();
        let (_stx, mut srx) = call.stream.split();
        let err = store.receive_upload(&mut srx).await.unwrap_err();
        assert_eq!(err.path.as_deref(), Some("uploads/data.bin"));
        assert!(matches!(err.error, TetherError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn truncated_upload_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (tx, _rx) = client.open(Method::Upload, &CallMetadata::new()).await.unwrap().split();
        tx.send(&chunk::split("short.bin", b"0123456789", 4)[0]).await.unwrap();
        tx.close_send().await.unwrap();

        let call = incoming.recv().await.unwrap();
        let (_stx, mut srx) = call.stream.split();
        assert!(store.receive_upload(&mut srx).await.is_err());
    }

    #[tokio::test]
    async fn missing_download_is_one_error_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (_tx, mut rx) = client.open(Method::Download, &CallMetadata::new()).await.unwrap().split();
        let call = incoming.recv().await.unwrap();
        let (stx, _srx) = call.stream.split();
        assert_eq!(store.send_download("ghost.bin", &stx).await.unwrap(), 0);

        let chunk: TransferChunk = rx.recv().await.unwrap().unwrap();
        assert!(chunk.is_error());
        assert!(chunk.is_last);
        assert_eq!(chunk.path, "ghost.bin");
    }

    #[tokio::test]
    async fn download_streams_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ten.bin"), b"0123456789").unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (_tx, mut rx) = client.open(Method::Download, &CallMetadata::new()).await.unwrap().split();
        let call = incoming.recv().await.unwrap();
        let (stx, _srx) = call.stream.split();
        assert_eq!(store.send_download("ten.bin", &stx).await.unwrap(), 3);

        let mut data = Vec::new();
        for _ in 0..3 {
            let chunk: TransferChunk = rx.recv().await.unwrap().unwrap();
            data.extend(chunk.data);
        }
        assert_eq!(data, b"0123456789");
    }

    #[tokio::test]
    async fn uploaded_name_downloads_from_the_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (tx, _rx) = client.open(Method::Upload, &CallMetadata::new()).await.unwrap().split();
        for chunk in chunk::split("a.bin", b"0123456789", 4) {
            tx.send(&chunk).await.unwrap();
        }
        let call = incoming.recv().await.unwrap();
        let (_stx, mut srx) = call.stream.split();
        let stored = store.receive_upload(&mut srx).await.unwrap();
        assert_eq!(stored.path, "uploads/a.bin");

        for name in ["a.bin", stored.path.as_str()] {
            let (_tx, mut rx) = client.open(Method::Download, &CallMetadata::new()).await.unwrap().split();
            let call = incoming.recv().await.unwrap();
            let (stx, _srx) = call.stream.split();
            assert_eq!(store.send_download(name, &stx).await.unwrap(), 3);

            let mut data = Vec::new();
            loop {
                let chunk: TransferChunk = rx.recv().await.unwrap().unwrap();
                assert!(!chunk.is_error(), "{name}: {:?}", chunk.error);
                data.extend(chunk.data);
                if chunk.is_last {
                    break;
                }
            }
            assert_eq!(data, b"0123456789");
        }
    }

    #[tokio::test]
    async fn root_copy_wins_over_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("same.txt"), b"root").unwrap();
        std::fs::write(dir.path().join("uploads").join("same.txt"), b"uploaded").unwrap();
        let store = store(dir.path());
        let (client, _server, mut incoming) = pair().await;

        let (_tx, mut rx) = client.open(Method::Download, &CallMetadata::new()).await.unwrap().split();
        let call = incoming.recv().await.unwrap();
        let (stx, _srx) = call.stream.split();
        store.send_download("same.txt", &stx).await.unwrap();

        let chunk: TransferChunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(chunk.data, b"root");
    }

    #[tokio::test]
    async fn list_returns_sorted_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let store = store(dir.path());

        assert_eq!(store.list("").await.unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(store.list("sub").await.unwrap(), Vec::<String>::new());
        assert_eq!(store.list("nope").await.unwrap_err().code, tether_core::StatusCode::NotFound);
        assert_eq!(
            store.list("../..").await.unwrap_err().code,
            tether_core::StatusCode::InvalidArgument
        );
    }
}
