//! Destination coordination
//!
//! A destination owns the writers of one job. Each part gets exactly one
//! [`DestWriter`], created on first request and looked up by the part's start
//! offset afterwards. The writer registry is guarded by a single mutex shared by
//! registration and teardown; writes on an individual writer happen outside it
//! because no two workers ever hold the same part.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::error_handling::{cancellable, DownloadError, DownloadResult};
use crate::core::integrity::verify_checksum;
use crate::core::models::{Part, SharedDownloadItem};
use crate::utils::file_utils::ensure_directory;

/// Progress callback for [`DownloadDestination::prepare_file`], percent when known
pub type PrepareProgress<'a> = &'a (dyn Fn(Option<u8>) + Send + Sync);

/// Open file handle for one part
#[derive(Debug)]
pub struct DestWriter {
    id: u64,
    path: PathBuf,
    to: Option<u64>,
    current: AtomicU64,
    file: Mutex<Option<File>>,
}

impl DestWriter {
    /// Open `path` read-write positioned at `current`. With `truncate` the file
    /// is recreated empty and the writer starts at 0.
    pub async fn open(
        id: u64,
        path: PathBuf,
        to: Option<u64>,
        current: u64,
        truncate: bool,
    ) -> DownloadResult<Self> {
        if truncate && tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        let current = if truncate { 0 } else { current };
        file.seek(SeekFrom::Start(current)).await?;

        Ok(Self {
            id,
            path,
            to,
            current: AtomicU64::new(current),
            file: Mutex::new(Some(file)),
        })
    }

    /// Start offset of the part this writer belongs to
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next byte position to be written
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Append `data` at the current position. Bytes past the part's end are
    /// dropped; the number of bytes kept is returned.
    pub async fn write(&self, data: &[u8]) -> DownloadResult<usize> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            DownloadError::InvalidState(format!("writer for part {} is closed", self.id))
        })?;

        let current = self.current();
        let accepted = match self.to {
            Some(to) => data.len().min((to + 1).saturating_sub(current) as usize),
            None => data.len(),
        };
        if accepted == 0 {
            return Ok(0);
        }

        file.write_all(&data[..accepted]).await?;
        self.current.fetch_add(accepted as u64, Ordering::AcqRel);
        Ok(accepted)
    }

    pub async fn flush(&self) -> DownloadResult<()> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Flush and release the handle. Closing twice is a no-op.
    pub async fn close(&self) -> DownloadResult<()> {
        let file = self.file.lock().await.take();
        if let Some(mut file) = file {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.file.lock().await.is_some()
    }
}

/// Writers of one job keyed by part start offset
#[derive(Debug, Default)]
pub struct WriterRegistry {
    writers: Mutex<BTreeMap<u64, Arc<DestWriter>>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing writer for `id`, or the one produced by `create`. Lookup,
    /// creation and registration happen under the registry lock, so concurrent
    /// requests for the same offset never create two files.
    pub async fn get_or_create<F, Fut>(&self, id: u64, create: F) -> DownloadResult<Arc<DestWriter>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DownloadResult<DestWriter>>,
    {
        let mut writers = self.writers.lock().await;
        if let Some(existing) = writers.get(&id) {
            return Ok(Arc::clone(existing));
        }
        let writer = Arc::new(create().await?);
        writers.insert(id, Arc::clone(&writer));
        Ok(writer)
    }

    pub async fn get(&self, id: u64) -> Option<Arc<DestWriter>> {
        self.writers.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.writers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.writers.lock().await.is_empty()
    }

    /// Best effort: every writer is attempted, failures are logged.
    pub async fn flush_all(&self) {
        let writers: Vec<Arc<DestWriter>> = self.writers.lock().await.values().cloned().collect();
        for writer in writers {
            if let Err(err) = writer.flush().await {
                tracing::warn!("flush failed for {}: {}", writer.path().display(), err);
            }
        }
    }

    /// Close every writer and empty the registry
    pub async fn close_all(&self) {
        let mut writers = self.writers.lock().await;
        for writer in writers.values() {
            if let Err(err) = writer.close().await {
                tracing::warn!("close failed for {}: {}", writer.path().display(), err);
            }
        }
        writers.clear();
    }
}

/// Where the parts of one job end up
#[async_trait]
pub trait DownloadDestination: Send + Sync {
    /// Writer for `part`, created on first request and reused afterwards
    async fn get_writer_for(&self, part: &Part) -> DownloadResult<Arc<DestWriter>>;

    /// Whether parts may be written through file writers at all
    fn can_get_file_writer(&self) -> bool {
        false
    }

    /// Make sure the output location exists before any writer is requested
    async fn prepare_file(&self, on_progress: PrepareProgress<'_>) -> DownloadResult<()>;

    /// Whether previously downloaded parts can be resumed
    async fn is_downloaded_parts_valid(&self) -> bool {
        true
    }

    /// Fired once every part reached its end. Long running work stops with
    /// `Cancelled` when `cancel` fires and can be run again later.
    async fn on_all_parts_completed(&self, _cancel: &CancellationToken) -> DownloadResult<()> {
        Ok(())
    }

    /// Flush every open writer. Never fails.
    async fn flush(&self);

    /// Parts were discarded: close every writer and forget them
    async fn on_all_file_parts_removed(&self);

    /// Final output file
    fn output_file(&self) -> &Path;
}

/// All parts share the final file, each writing at its own offset through its own handle
pub struct SingleFileDestination {
    file: PathBuf,
    item: SharedDownloadItem,
    registry: WriterRegistry,
}

impl SingleFileDestination {
    pub fn new(item: SharedDownloadItem) -> Self {
        let file = item.read().output_path();
        Self {
            file,
            item,
            registry: WriterRegistry::new(),
        }
    }
}

#[async_trait]
impl DownloadDestination for SingleFileDestination {
    async fn get_writer_for(&self, part: &Part) -> DownloadResult<Arc<DestWriter>> {
        let path = self.file.clone();
        self.registry
            .get_or_create(part.from, || {
                DestWriter::open(part.from, path, part.to, part.current, false)
            })
            .await
    }

    fn can_get_file_writer(&self) -> bool {
        true
    }

    async fn prepare_file(&self, on_progress: PrepareProgress<'_>) -> DownloadResult<()> {
        let parent = self
            .file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ensure_directory(&parent).await?;

        let length = self.item.read().known_length();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.file)
            .await?;
        if let Some(length) = length {
            if file.metadata().await?.len() != length {
                file.set_len(length).await?;
            }
        }
        on_progress(Some(100));
        Ok(())
    }

    async fn is_downloaded_parts_valid(&self) -> bool {
        let expected = self.item.read().known_length();
        match tokio::fs::metadata(&self.file).await {
            Ok(meta) => expected.map(|len| meta.len() == len).unwrap_or(true),
            Err(_) => false,
        }
    }

    async fn on_all_parts_completed(&self, cancel: &CancellationToken) -> DownloadResult<()> {
        self.registry.close_all().await;
        let checksum = self.item.read().file_checksum.clone();
        if let Some(checksum) = checksum {
            cancellable(cancel, verify_checksum(&self.file, &checksum)).await?;
            tracing::info!("checksum verified for {}", self.file.display());
        }
        Ok(())
    }

    async fn flush(&self) {
        self.registry.flush_all().await;
    }

    async fn on_all_file_parts_removed(&self) {
        self.registry.close_all().await;
    }

    fn output_file(&self) -> &Path {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{DownloadCredentials, DownloadItem};
    use tempfile::tempdir;

    fn single_file(dir: &Path, length: i64) -> SingleFileDestination {
        let mut item = DownloadItem::new(
            1,
            DownloadCredentials::new("https://h/file.bin"),
            dir.join("out").to_string_lossy().to_string(),
            "file.bin",
        );
        item.content_length = length;
        SingleFileDestination::new(item.into_shared())
    }

    #[tokio::test]
    async fn test_writer_caps_at_part_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.ts");
        let writer = DestWriter::open(1, path.clone(), Some(3), 0, true).await.unwrap();

        assert_eq!(writer.write(b"ab").await.unwrap(), 2);
        assert_eq!(writer.write(b"cdef").await.unwrap(), 2);
        assert_eq!(writer.write(b"g").await.unwrap(), 0);
        assert_eq!(writer.current(), 4);

        writer.close().await.unwrap();
        assert!(!writer.is_open().await);
        assert!(writer.write(b"h").await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_same_offset_returns_same_writer() {
        let dir = tempdir().unwrap();
        let dest = single_file(dir.path(), 10);
        dest.prepare_file(&|_| {}).await.unwrap();

        let a = dest.get_writer_for(&Part::new(0, Some(4), 0, "l")).await.unwrap();
        let b = dest.get_writer_for(&Part::new(0, Some(4), 0, "l")).await.unwrap();
        let c = dest.get_writer_for(&Part::new(5, Some(9), 5, "l")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.current(), 5);
    }

    #[tokio::test]
    async fn test_parts_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let dest = single_file(dir.path(), 8);
        dest.prepare_file(&|_| {}).await.unwrap();
        assert!(dest.is_downloaded_parts_valid().await);

        let tail = dest.get_writer_for(&Part::new(4, Some(7), 4, "l")).await.unwrap();
        let head = dest.get_writer_for(&Part::new(0, Some(3), 0, "l")).await.unwrap();
        tail.write(b"5678").await.unwrap();
        head.write(b"1234").await.unwrap();

        dest.on_all_parts_completed(&CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read(dest.output_file()).unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_completion() {
        let dir = tempdir().unwrap();
        let dest = single_file(dir.path(), 2);
        dest.item.write().file_checksum = Some("md5:00000000000000000000000000000000".to_string());
        dest.prepare_file(&|_| {}).await.unwrap();

        let writer = dest.get_writer_for(&Part::new(0, Some(1), 0, "l")).await.unwrap();
        writer.write(b"hi").await.unwrap();

        let err = dest.on_all_parts_completed(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_invalidates_parts() {
        let dir = tempdir().unwrap();
        let dest = single_file(dir.path(), 4);
        assert!(!dest.is_downloaded_parts_valid().await);
    }

    #[tokio::test]
    async fn test_removed_parts_close_everything() {
        let dir = tempdir().unwrap();
        let dest = single_file(dir.path(), 10);
        dest.prepare_file(&|_| {}).await.unwrap();

        let a = dest.get_writer_for(&Part::new(0, Some(4), 0, "l")).await.unwrap();
        let b = dest.get_writer_for(&Part::new(5, Some(9), 5, "l")).await.unwrap();
        dest.on_all_file_parts_removed().await;

        assert!(!a.is_open().await);
        assert!(!b.is_open().await);
        assert!(dest.registry.is_empty().await);
    }
}
