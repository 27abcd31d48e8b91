//! Playlist resolution
//!
//! [`PlaylistResolver::parse_m3u8`] fetches a media playlist, records its key
//! context on the job and probes every segment once per manifest URI.
//! [`PlaylistResolver::resolve_part_info`] hands the resolved parts to exactly
//! one consumer.

use futures::stream::{self, StreamExt, TryStreamExt};
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::client::{DownloaderClient, ResponseInfo};
use crate::core::error_handling::{cancellable, DownloadError, DownloadResult};
use crate::core::models::{
    DownloadCredentials, M3u8Info, Part, SEG_KEY_IV, SEG_KEY_METHOD, SEG_KEY_URI,
    SEG_MEDIA_SEQUENCE,
};
use crate::core::single_flight::SingleFlightCache;

pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

pub struct PlaylistResolver {
    cache: SingleFlightCache<String, Arc<M3u8Info>>,
    probe_concurrency: usize,
}

impl Default for PlaylistResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_CONCURRENCY)
    }
}

impl PlaylistResolver {
    pub fn new(probe_concurrency: usize) -> Self {
        Self {
            cache: SingleFlightCache::new(),
            probe_concurrency: probe_concurrency.max(1),
        }
    }

    /// Fetch and parse the manifest at `credentials.link`, store its key
    /// context in `credentials.m3u8_props` and make sure the segment lengths are
    /// resolved. The returned response carries the summed segment length as
    /// its content length.
    ///
    /// When `cancel` fires this caller stops waiting with `Cancelled`. If it was
    /// the one probing, another caller waiting on the same manifest takes the
    /// probing over; nothing is cached for the cancelled attempt.
    pub async fn parse_m3u8(
        &self,
        client: &dyn DownloaderClient,
        credentials: &mut DownloadCredentials,
        cancel: &CancellationToken,
    ) -> DownloadResult<ResponseInfo> {
        let (mut response_info, body) = cancellable(cancel, async {
            let connection = client.connect(credentials, None, None).await?;
            let response_info = connection.response_info.clone();
            let body = connection.read_to_end().await?;
            Ok::<_, DownloadError>((response_info, body))
        })
        .await?;

        let playlist = match m3u8_rs::parse_playlist_res(&body) {
            Ok(Playlist::MediaPlaylist(playlist)) => playlist,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(DownloadError::Parse(format!(
                    "{} is a master playlist, pick a variant first",
                    credentials.link
                )));
            }
            Err(e) => {
                return Err(DownloadError::Parse(format!(
                    "invalid playlist {}: {:?}",
                    credentials.link, e
                )));
            }
        };

        let base = Url::parse(&credentials.link)?;
        record_key_context(credentials, &base, &playlist)?;

        let segment_links = playlist
            .segments
            .iter()
            .map(|segment| base.join(&segment.uri).map(String::from))
            .collect::<Result<Vec<_>, _>>()?;

        let credentials: &DownloadCredentials = credentials;
        let info = cancellable(
            cancel,
            self.cache.get_or_try_init(credentials.link.clone(), || {
                self.probe_segments(client, credentials, segment_links)
            }),
        )
        .await?;

        tracing::info!(
            "playlist {} resolved: {} segments, {} bytes",
            credentials.link,
            info.parts.len(),
            info.length
        );
        response_info.set_content_length(info.length);
        Ok(response_info)
    }

    /// Remove and return the parts resolved for `credentials.link`.
    ///
    /// The read is destructive: when several jobs for the same manifest parse it
    /// at once they share one probe run, but only the first to call this gets
    /// the parts. The others get `CacheMiss` and have to call
    /// [`PlaylistResolver::parse_m3u8`] again.
    pub fn resolve_part_info(&self, credentials: &DownloadCredentials) -> DownloadResult<Vec<Part>> {
        let info = self
            .cache
            .take_once(&credentials.link)
            .ok_or_else(|| DownloadError::CacheMiss {
                link: credentials.link.clone(),
            })?;
        Ok(Arc::try_unwrap(info)
            .map(|info| info.parts)
            .unwrap_or_else(|shared| shared.parts.clone()))
    }

    pub fn is_resolved(&self, link: &str) -> bool {
        self.cache.contains(&link.to_string())
    }

    async fn probe_segments(
        &self,
        client: &dyn DownloaderClient,
        credentials: &DownloadCredentials,
        segment_links: Vec<String>,
    ) -> DownloadResult<Arc<M3u8Info>> {
        tracing::debug!(
            "probing {} segments of {} ({} at a time)",
            segment_links.len(),
            credentials.link,
            self.probe_concurrency
        );

        let probes = segment_links.into_iter().enumerate().map(|(index, link)| {
            let segment_credentials = credentials.with_link(&link);
            async move {
                let info = client.test(&segment_credentials).await?;
                let length = info.total_length().filter(|len| *len > 0);
                Ok::<_, DownloadError>((index as u64 + 1, link, length))
            }
        });

        // buffered 保持清单顺序
        let probed: Vec<(u64, String, Option<u64>)> = stream::iter(probes)
            .buffered(self.probe_concurrency)
            .try_collect()
            .await?;

        let length: u64 = probed.iter().filter_map(|(_, _, len)| *len).sum();
        let parts = probed
            .into_iter()
            .map(|(index, link, len)| Part::new(index, len.map(|len| len - 1), 0, link))
            .collect();

        Ok(Arc::new(M3u8Info { length, parts }))
    }
}

fn key_method_name(method: &KeyMethod) -> String {
    match method {
        KeyMethod::None => "NONE".to_string(),
        KeyMethod::AES128 => "AES-128".to_string(),
        KeyMethod::SampleAES => "SAMPLE-AES".to_string(),
        KeyMethod::Other(other) => other.clone(),
    }
}

/// Key context comes from the first segment only; keys rotated later in the
/// playlist are not tracked.
fn record_key_context(
    credentials: &mut DownloadCredentials,
    base: &Url,
    playlist: &MediaPlaylist,
) -> DownloadResult<()> {
    let props = &mut credentials.m3u8_props;
    for key in [SEG_KEY_URI, SEG_KEY_METHOD, SEG_KEY_IV] {
        props.remove(key);
    }
    props.insert(
        SEG_MEDIA_SEQUENCE.to_string(),
        playlist.media_sequence.to_string(),
    );

    let Some(key) = playlist.segments.first().and_then(|segment| segment.key.as_ref()) else {
        return Ok(());
    };

    let uri = match &key.uri {
        Some(uri) => base.join(uri)?.to_string(),
        None => String::new(),
    };
    props.insert(SEG_KEY_URI.to_string(), uri);
    props.insert(SEG_KEY_METHOD.to_string(), key_method_name(&key.method));
    if let Some(iv) = &key.iv {
        props.insert(SEG_KEY_IV.to_string(), iv.clone());
    }
    Ok(())
}
