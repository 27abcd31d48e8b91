//! Destination for playlist jobs: one file per segment in a parts directory,
//! decrypted and remuxed into the final output once every segment is down.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::client::DownloaderClient;
use crate::core::config::HlsSettings;
use crate::core::decryption::{decrypt_segments, discard_decryption};
use crate::core::destination::{
    DestWriter, DownloadDestination, PrepareProgress, WriterRegistry,
};
use crate::core::error_handling::DownloadResult;
use crate::core::models::{Part, SharedDownloadItem};
use crate::core::remux::{finish_remux, Remuxer};
use crate::utils::file_utils::{ensure_directory, sibling_with_suffix};

/// Set once the segments on disk are plaintext, so a retried completion
/// (e.g. after a failed remux) does not decrypt them twice
pub const SEGMENTS_DECRYPTED: &str = "X-KEY-DECRYPTED";

pub struct HlsDownloadDestination {
    file: PathBuf,
    parts_dir: PathBuf,
    extension: String,
    item: SharedDownloadItem,
    client: Arc<dyn DownloaderClient>,
    remuxer: Arc<dyn Remuxer>,
    registry: WriterRegistry,
}

impl HlsDownloadDestination {
    pub fn new(
        item: SharedDownloadItem,
        client: Arc<dyn DownloaderClient>,
        remuxer: Arc<dyn Remuxer>,
        settings: &HlsSettings,
    ) -> Self {
        let file = item.read().output_path();
        let parts_dir = sibling_with_suffix(&file, &settings.parts_dir_suffix);
        Self {
            file,
            parts_dir,
            extension: settings.segment_extension.clone(),
            item,
            client,
            remuxer,
            registry: WriterRegistry::new(),
        }
    }

    pub fn parts_dir(&self) -> &Path {
        &self.parts_dir
    }

    /// `<parts_dir>/<from>.<ext>`
    pub fn segment_path(&self, from: u64) -> PathBuf {
        self.parts_dir.join(format!("{}.{}", from, self.extension))
    }

    async fn decrypt_once(&self, cancel: &CancellationToken) -> DownloadResult<()> {
        let credentials = self.item.read().credentials.clone();
        if credentials.prop(SEGMENTS_DECRYPTED).is_some() {
            tracing::debug!("segments in {} already decrypted", self.parts_dir.display());
            return Ok(());
        }

        let decrypted = decrypt_segments(
            self.client.as_ref(),
            &credentials,
            &self.parts_dir,
            &self.extension,
            cancel,
        )
        .await?;
        if decrypted > 0 {
            self.item
                .write()
                .credentials
                .m3u8_props
                .insert(SEGMENTS_DECRYPTED.to_string(), "true".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl DownloadDestination for HlsDownloadDestination {
    async fn get_writer_for(&self, part: &Part) -> DownloadResult<Arc<DestWriter>> {
        let path = self.segment_path(part.from);
        let parts_dir = self.parts_dir.as_path();
        let item = &self.item;
        self.registry
            .get_or_create(part.from, || async move {
                // 分片将被重新写入密文
                item.write().credentials.m3u8_props.remove(SEGMENTS_DECRYPTED);
                discard_decryption(parts_dir, &path).await?;
                DestWriter::open(part.from, path, part.to, 0, true).await
            })
            .await
    }

    fn can_get_file_writer(&self) -> bool {
        true
    }

    async fn prepare_file(&self, on_progress: PrepareProgress<'_>) -> DownloadResult<()> {
        on_progress(None);
        let canonical = ensure_directory(&self.parts_dir).await?;
        tracing::debug!("parts directory ready: {}", canonical.display());
        on_progress(Some(100));
        Ok(())
    }

    async fn on_all_parts_completed(&self, cancel: &CancellationToken) -> DownloadResult<()> {
        self.registry.close_all().await;
        self.decrypt_once(cancel).await?;
        finish_remux(self.remuxer.as_ref(), &self.parts_dir, &self.file, cancel).await
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
