//! Job runner
//!
//! [`DownloadJob`] drives one download from part resolution to the
//! destination's completion hook. Pending parts run concurrently, each on its
//! own task with its own writer, bounded by the job's connection count.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::bandwidth::BandwidthController;
use crate::core::client::DownloaderClient;
use crate::core::config::{DownloadSettings, EngineConfig};
use crate::core::destination::{DownloadDestination, SingleFileDestination};
use crate::core::error_handling::{
    cancellable, check_cancelled, DownloadError, DownloadResult, RetryPolicy,
};
use crate::core::hls_destination::{HlsDownloadDestination, SEGMENTS_DECRYPTED};
use crate::core::models::{
    DownloadCredentials, DownloadItem, DownloadStatus, Part, SharedDownloadItem,
};
use crate::core::playlist::PlaylistResolver;
use crate::core::remux::remuxer_for;

pub struct DownloadJob {
    item: SharedDownloadItem,
    client: Arc<dyn DownloaderClient>,
    destination: Arc<dyn DownloadDestination>,
    resolver: Arc<PlaylistResolver>,
    settings: DownloadSettings,
    bandwidth: BandwidthController,
    parts: Arc<Mutex<Vec<Part>>>,
    /// Replaced once a run has observed it, so a cancel issued before `run`
    /// still applies
    cancel: Mutex<CancellationToken>,
}

impl DownloadJob {
    pub fn new(
        item: SharedDownloadItem,
        client: Arc<dyn DownloaderClient>,
        destination: Arc<dyn DownloadDestination>,
        resolver: Arc<PlaylistResolver>,
        settings: DownloadSettings,
    ) -> Self {
        let bandwidth = BandwidthController::with_limit(item.read().speed_limit);
        Self {
            item,
            client,
            destination,
            resolver,
            settings,
            bandwidth,
            parts: Arc::new(Mutex::new(Vec::new())),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Job with the destination matching the item: segment files plus remux for
    /// playlists, a single pre-sized file otherwise
    pub fn from_config(
        item: SharedDownloadItem,
        client: Arc<dyn DownloaderClient>,
        resolver: Arc<PlaylistResolver>,
        config: &EngineConfig,
    ) -> Self {
        let destination: Arc<dyn DownloadDestination> = if item.read().is_m3u8() {
            Arc::new(HlsDownloadDestination::new(
                Arc::clone(&item),
                Arc::clone(&client),
                remuxer_for(&config.hls),
                &config.hls,
            ))
        } else {
            Arc::new(SingleFileDestination::new(Arc::clone(&item)))
        };
        Self::new(item, client, destination, resolver, config.download.clone())
    }

    /// Resume from parts persisted by an earlier run
    pub fn with_parts(self, parts: Vec<Part>) -> Self {
        *self.parts.lock() = parts;
        self
    }

    pub fn item(&self) -> &SharedDownloadItem {
        &self.item
    }

    pub fn destination(&self) -> &Arc<dyn DownloadDestination> {
        &self.destination
    }

    pub fn bandwidth(&self) -> &BandwidthController {
        &self.bandwidth
    }

    /// Snapshot of the current parts, for persistence
    pub fn parts(&self) -> Vec<Part> {
        self.parts.lock().clone()
    }

    /// Stop the job wherever it is: resolution, part downloads, decryption or
    /// remux. `run` returns `Cancelled` and the job is left paused with its
    /// parts resumable. A cancel issued before `run` makes that run pause
    /// right away.
    pub fn cancel(&self) {
        tracing::info!("cancelling job {}", self.item.read().id);
        self.cancel.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    /// Discard every part: writers are closed and the part list is cleared
    pub async fn remove_parts(&self) {
        self.destination.on_all_file_parts_removed().await;
        self.parts.lock().clear();
    }

    pub async fn run(&self) -> DownloadResult<()> {
        self.item.write().transition_to(DownloadStatus::Downloading)?;

        let cancel = self.cancel.lock().clone();
        let result = self.download(&cancel).await;
        if cancel.is_cancelled() {
            // 取消请求已被本次运行消费
            *self.cancel.lock() = CancellationToken::new();
        }
        let next = match &result {
            Ok(()) => DownloadStatus::Completed,
            Err(err) if err.is_cancelled() => DownloadStatus::Paused,
            Err(_) => DownloadStatus::Error,
        };

        let id = {
            let mut item = self.item.write();
            item.transition_to(next)?;
            item.id
        };
        match &result {
            Ok(()) => tracing::info!("job {} completed", id),
            Err(err) if err.is_cancelled() => tracing::info!("job {} paused", id),
            Err(err) => tracing::error!("job {} failed ({:?}): {}", id, err.category(), err),
        }
        result
    }

    async fn download(&self, cancel: &CancellationToken) -> DownloadResult<()> {
        check_cancelled(cancel)?;
        let mut parts = self.ensure_parts(cancel).await?;

        let segmented = self.item.read().is_m3u8();
        let has_progress = parts.iter().any(|part| part_progress(part, segmented) > 0);
        if has_progress && !self.destination.is_downloaded_parts_valid().await {
            tracing::warn!("downloaded parts are no longer valid, starting over");
            self.remove_parts().await;
            parts = self.ensure_parts(cancel).await?;
        }

        check_cancelled(cancel)?;
        self.destination
            .prepare_file(&|percent| tracing::debug!("preparing destination: {:?}", percent))
            .await?;

        self.download_parts(parts, cancel).await?;
        check_cancelled(cancel)?;

        self.destination.flush().await;
        self.destination.on_all_parts_completed(cancel).await
    }

    async fn ensure_parts(&self, cancel: &CancellationToken) -> DownloadResult<Vec<Part>> {
        let existing = self.parts();
        if !existing.is_empty() {
            return Ok(existing);
        }

        let segmented = self.item.read().is_m3u8();
        let parts = if segmented {
            self.resolve_playlist_parts(cancel).await?
        } else {
            self.resolve_plain_parts(cancel).await?
        };
        *self.parts.lock() = parts.clone();
        Ok(parts)
    }

    async fn resolve_playlist_parts(&self, cancel: &CancellationToken) -> DownloadResult<Vec<Part>> {
        let mut credentials = self.item.read().credentials.clone();
        // 重新解析意味着分片会重新下载
        credentials.m3u8_props.remove(SEGMENTS_DECRYPTED);

        let info = self
            .resolver
            .parse_m3u8(self.client.as_ref(), &mut credentials, cancel)
            .await?;
        let parts = self.resolver.resolve_part_info(&credentials)?;

        let mut item = self.item.write();
        item.credentials = credentials;
        item.content_length = length_or_unknown(info.total_length());
        item.server_etag = info.etag().map(str::to_string);
        tracing::info!("job {}: {} segments, {} bytes", item.id, parts.len(), item.content_length);
        Ok(parts)
    }

    async fn resolve_plain_parts(&self, cancel: &CancellationToken) -> DownloadResult<Vec<Part>> {
        let credentials = self.item.read().credentials.clone();
        let info = cancellable(cancel, self.client.test(&credentials)).await?;
        let length = info.total_length();

        let connections = {
            let mut item = self.item.write();
            item.content_length = length_or_unknown(length);
            item.server_etag = info.etag().map(str::to_string);
            item.preferred_connection_count
                .unwrap_or(self.settings.default_connections)
        };
        let connections = if info.supports_range() { connections } else { 1 };

        Ok(split_parts(
            &credentials.link,
            length,
            connections,
            self.settings.min_split_size,
        ))
    }

    fn connection_count(&self) -> usize {
        self.item
            .read()
            .preferred_connection_count
            .unwrap_or(self.settings.default_connections)
            .max(1) as usize
    }

    async fn download_parts(&self, parts: Vec<Part>, cancel: &CancellationToken) -> DownloadResult<()> {
        let pending: Vec<Part> = parts.into_iter().filter(|p| !p.is_completed()).collect();
        if pending.is_empty() {
            tracing::info!("所有分片已完成");
            return Ok(());
        }

        let max_concurrent = self.connection_count().min(pending.len());
        tracing::info!(
            "开始下载 {} 个分片，最大并发: {}",
            pending.len(),
            max_concurrent
        );

        let worker = Arc::new(PartWorker {
            client: Arc::clone(&self.client),
            destination: Arc::clone(&self.destination),
            credentials: self.item.read().credentials.clone(),
            bandwidth: self.bandwidth.clone(),
            retry_policy: self.settings.retry_policy(),
            cancel: cancel.clone(),
            abort_flag: Arc::new(AtomicBool::new(false)),
            parts: Arc::clone(&self.parts),
        });

        // 创建信号量控制并发数
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut handles = Vec::with_capacity(pending.len());
        for part in pending {
            let semaphore = Arc::clone(&semaphore);
            let worker = Arc::clone(&worker);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| DownloadError::InvalidState("part semaphore closed".to_string()))?;
                let result = worker.download(part).await;
                if let Err(err) = &result {
                    if !err.is_cancelled() {
                        worker.abort_flag.store(true, Ordering::SeqCst);
                    }
                }
                result
            }));
        }

        let mut first_error: Option<DownloadError> = None;
        let mut cancelled = false;
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| DownloadError::InvalidState(format!("part task failed: {e}")))
                .and_then(|result| result);
            match result {
                Ok(_) => {}
                Err(err) if err.is_cancelled() => cancelled = true,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            self.destination.flush().await;
            return Err(err);
        }
        if cancelled {
            self.destination.flush().await;
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }
}

/// Everything a part task needs, shared between the tasks of one run
struct PartWorker {
    client: Arc<dyn DownloaderClient>,
    destination: Arc<dyn DownloadDestination>,
    credentials: DownloadCredentials,
    bandwidth: BandwidthController,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    /// Set when a sibling part failed for good
    abort_flag: Arc<AtomicBool>,
    parts: Arc<Mutex<Vec<Part>>>,
}

impl PartWorker {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.abort_flag.load(Ordering::SeqCst)
    }

    async fn download(&self, mut part: Part) -> DownloadResult<Part> {
        let mut retry_count = 0;

        while retry_count <= self.retry_policy.max_retries {
            if self.should_stop() {
                return Err(DownloadError::Cancelled);
            }

            match self.attempt(&mut part).await {
                Ok(()) => {
                    tracing::debug!("分片 {} 下载完成", part.from);
                    return Ok(part);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    retry_count += 1;
                    if err.is_retryable() && retry_count <= self.retry_policy.max_retries {
                        let delay = self.retry_policy.delay_for(retry_count);
                        tracing::warn!(
                            "分片 {} 下载失败，第 {} 次重试 ({:?} 后): {}",
                            part.from,
                            retry_count,
                            delay,
                            err
                        );
                        cancellable(&self.cancel, async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await?;
                    } else {
                        tracing::error!("分片 {} 下载失败: {}", part.from, err);
                        return Err(err);
                    }
                }
            }
        }

        Err(DownloadError::InvalidState(format!(
            "part {} exhausted its retries",
            part.from
        )))
    }

    async fn attempt(&self, part: &mut Part) -> DownloadResult<()> {
        let writer = self.destination.get_writer_for(part).await?;
        // 分片文件可能被重建，以写入器位置为准
        part.current = writer.current();
        self.publish(part);
        if part.is_completed() {
            return Ok(());
        }

        let start = part.current;
        let segment_credentials = self.credentials.with_link(part.link.as_str());
        let mut connection = cancellable(
            &self.cancel,
            self.client.connect(&segment_credentials, Some(start), part.to),
        )
        .await?;

        // Servers that ignore Range resend the whole body
        let mut skip = if start > 0 && connection.response_info.status_code != 206 {
            start
        } else {
            0
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = connection.source.next() => Some(chunk),
            };
            let chunk = match next {
                Some(Some(chunk)) if !self.should_stop() => chunk?,
                Some(None) => break,
                _ => {
                    writer.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
            };
            let mut data = &chunk[..];
            if skip > 0 {
                let skipped = (skip as usize).min(data.len());
                data = &data[skipped..];
                skip -= skipped as u64;
            }
            if data.is_empty() {
                continue;
            }

            let written = writer.write(data).await?;
            part.current = writer.current();
            self.publish(part);
            self.bandwidth.throttle(written as u64).await;

            if part.is_completed() {
                break;
            }
        }
        writer.flush().await?;

        match part.to {
            Some(to) if part.current <= to => Err(DownloadError::protocol(
                format!(
                    "{} closed early at byte {} of {}",
                    part.link,
                    part.current,
                    to + 1
                ),
                None,
            )),
            Some(_) => Ok(()),
            None if part.current > 0 => {
                // 长度未知的分片以 EOF 为结束
                part.to = Some(part.current - 1);
                self.publish(part);
                Ok(())
            }
            None => Err(DownloadError::protocol(
                format!("{} returned an empty body", part.link),
                None,
            )),
        }
    }

    fn publish(&self, part: &Part) {
        let mut parts = self.parts.lock();
        if let Some(slot) = parts.iter_mut().find(|p| p.from == part.from) {
            *slot = part.clone();
        }
    }
}

/// Bytes already on disk for `part`. Plain parts start writing at their
/// offset, segment parts at 0.
fn part_progress(part: &Part, segmented: bool) -> u64 {
    if segmented {
        part.current
    } else {
        part.current.saturating_sub(part.from)
    }
}

fn length_or_unknown(length: Option<u64>) -> i64 {
    length
        .map(|len| len as i64)
        .unwrap_or(DownloadItem::LENGTH_UNKNOWN)
}

/// Even split of a plain download. Unknown lengths get one open-ended part,
/// an empty resource gets none.
pub fn split_parts(link: &str, length: Option<u64>, connections: u32, min_split_size: u64) -> Vec<Part> {
    let Some(length) = length else {
        return vec![Part::new(0, None, 0, link)];
    };
    if length == 0 {
        return Vec::new();
    }

    let by_size = (length / min_split_size.max(1)).max(1);
    let count = (connections.max(1) as u64).min(by_size);
    let chunk = length / count;

    (0..count)
        .map(|i| {
            let from = i * chunk;
            let to = if i + 1 == count {
                length - 1
            } else {
                (i + 1) * chunk - 1
            };
            Part::new(from, Some(to), from, link)
        })
        .collect()
}
