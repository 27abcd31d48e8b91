//! In-memory transport and remuxers shared by the tests

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::client::{Connection, DownloaderClient, ResponseInfo};
use crate::core::error_handling::{cancellable, DownloadError, DownloadResult};
use crate::core::models::DownloadCredentials;
use crate::core::remux::{ConcatRemuxer, Remuxer};

const CHUNK_SIZE: usize = 64;

/// Serves registered resources, honours ranges and counts probes
#[derive(Default)]
pub struct MockClient {
    resources: Mutex<HashMap<String, Bytes>>,
    /// Links whose probes fail with the given status
    failing_probes: Mutex<HashMap<String, u16>>,
    /// Links whose next N fetches fail with the given status
    failing_fetches: Mutex<HashMap<String, (usize, u16)>>,
    requests: Mutex<Vec<(String, Option<u64>, Option<u64>)>>,
    probes: AtomicUsize,
    probe_delay: Option<Duration>,
    chunk_delay: Option<Duration>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(self, link: &str, body: impl Into<Bytes>) -> Self {
        self.resources.lock().insert(link.to_string(), body.into());
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn fail_probe(self, link: &str, status: u16) -> Self {
        self.failing_probes.lock().insert(link.to_string(), status);
        self
    }

    pub fn fail_fetches(self, link: &str, times: usize, status: u16) -> Self {
        self.failing_fetches
            .lock()
            .insert(link.to_string(), (times, status));
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// `(link, range_start, range_end)` of every fetch so far
    pub fn requests(&self) -> Vec<(String, Option<u64>, Option<u64>)> {
        self.requests.lock().clone()
    }

    pub fn fetches_of(&self, link: &str) -> usize {
        self.requests.lock().iter().filter(|(l, _, _)| l == link).count()
    }

    fn body(&self, link: &str) -> DownloadResult<Bytes> {
        self.resources
            .lock()
            .get(link)
            .cloned()
            .ok_or_else(|| DownloadError::protocol(format!("{link} not found"), Some(404)))
    }

    fn take_fetch_failure(&self, link: &str) -> Option<u16> {
        let mut failing = self.failing_fetches.lock();
        let (remaining, status) = failing.get_mut(link)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*status)
    }
}

#[async_trait]
impl DownloaderClient for MockClient {
    async fn connect(
        &self,
        credentials: &DownloadCredentials,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> DownloadResult<Connection> {
        let link = credentials.link.clone();
        self.requests.lock().push((link.clone(), range_start, range_end));
        if let Some(status) = self.take_fetch_failure(&link) {
            return Err(DownloadError::protocol(format!("{link} failed"), Some(status)));
        }

        let body = self.body(&link)?;
        let total = body.len() as u64;
        let ranged = range_end.is_some() || range_start.unwrap_or(0) > 0;

        let (response_info, slice) = if ranged && total > 0 {
            let start = range_start.unwrap_or(0).min(total);
            let end = range_end.unwrap_or(total - 1).min(total - 1);
            let slice = if start <= end {
                body.slice(start as usize..=end as usize)
            } else {
                Bytes::new()
            };
            let info = ResponseInfo::new(206)
                .with_header("content-range", format!("bytes {start}-{end}/{total}"))
                .with_header("content-length", slice.len().to_string());
            (info, slice)
        } else {
            let info = ResponseInfo::new(200).with_header("content-length", total.to_string());
            (info, body)
        };

        let chunks: Vec<DownloadResult<Bytes>> = slice
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        let delay = self.chunk_delay;
        let source = futures_util::stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed();

        Ok(Connection {
            source,
            response_info,
        })
    }

    async fn test(&self, credentials: &DownloadCredentials) -> DownloadResult<ResponseInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.failing_probes.lock().get(&credentials.link).copied() {
            return Err(DownloadError::protocol(
                format!("{} probe failed", credentials.link),
                Some(status),
            ));
        }
        let body = self.body(&credentials.link)?;
        Ok(ResponseInfo::new(200)
            .with_header("content-length", body.len().to_string())
            .with_header("accept-ranges", "bytes"))
    }
}

/// Byte-concatenating remuxer that counts its calls and can fail or stall
/// the first N
#[derive(Default)]
pub struct RecordingRemuxer {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    stalls_left: AtomicUsize,
}

impl RecordingRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    /// The first `times` calls hang until cancelled
    pub fn stalling_first(times: usize) -> Self {
        Self {
            stalls_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remuxer for RecordingRemuxer {
    async fn remux(
        &self,
        parts_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures_left) {
            return Err(DownloadError::Remux("muxer exited with status 1".to_string()));
        }
        if take_one(&self.stalls_left) {
            cancellable(cancel, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await?;
        }
        ConcatRemuxer::new("ts").remux(parts_dir, output, cancel).await
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// Media playlist over `segments`, optionally keyed with the given
/// `#EXT-X-KEY` attribute list
pub fn media_playlist(segments: &[&str], key: Option<&str>) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n");
    if let Some(key) = key {
        playlist.push_str(&format!("#EXT-X-KEY:{key}\n"));
    }
    for segment in segments {
        playlist.push_str(&format!("#EXTINF:10.0,\n{segment}\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
