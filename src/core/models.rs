//! Core data models for the segment download engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::error_handling::{DownloadError, DownloadResult};

/// Stream property holding the resolved key URI of the first encrypted segment
pub const SEG_KEY_URI: &str = "X-KEY-URI";
/// Stream property holding the declared key method (`NONE`, `AES-128`, ...)
pub const SEG_KEY_METHOD: &str = "X-KEY-METHOD";
/// Stream property holding the IV string as written in the manifest
pub const SEG_KEY_IV: &str = "EXT-X-KEY";
/// Stream property holding the manifest's media sequence number
pub const SEG_MEDIA_SEQUENCE: &str = "X-MEDIA-SEQUENCE";

/// What to fetch: link plus everything needed to authenticate against it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadCredentials {
    pub link: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Referring page, sent as `Referer`
    #[serde(default)]
    pub download_page: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Adaptive-stream (HLS) job
    #[serde(default)]
    pub m3u8: bool,
    #[serde(default)]
    pub m3u8_props: HashMap<String, String>,
}

impl DownloadCredentials {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ..Default::default()
        }
    }

    /// Same headers and auth, pointed at another link. Stream properties are not carried.
    pub fn with_link(&self, link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            headers: self.headers.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            download_page: self.download_page.clone(),
            user_agent: self.user_agent.clone(),
            m3u8: false,
            m3u8_props: HashMap::new(),
        }
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.m3u8_props.get(key).map(String::as_str)
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Added,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self::Added
    }
}

impl DownloadStatus {
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Added, Downloading)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Error)
                | (Paused, Downloading)
                | (Error, Downloading)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

/// Download job descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    #[serde(flatten)]
    pub credentials: DownloadCredentials,

    pub id: i64,
    pub folder: String,
    pub name: String,

    /// [`DownloadItem::LENGTH_UNKNOWN`] until the server reports a length
    pub content_length: i64,
    pub server_etag: Option<String>,

    pub date_added: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub status: DownloadStatus,
    pub preferred_connection_count: Option<u32>,
    /// Bytes per second, 0 is unlimited
    pub speed_limit: u64,

    /// `<algorithm>:<hex digest>`, e.g. `sha256:9f86d0...`
    pub file_checksum: Option<String>,
}

/// Job handle shared between the runner and its destination
pub type SharedDownloadItem = Arc<parking_lot::RwLock<DownloadItem>>;

impl DownloadItem {
    pub const LENGTH_UNKNOWN: i64 = -1;

    pub fn new(
        id: i64,
        credentials: DownloadCredentials,
        folder: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            id,
            folder: folder.into(),
            name: name.into(),
            content_length: Self::LENGTH_UNKNOWN,
            server_etag: None,
            date_added: Utc::now(),
            start_time: None,
            complete_time: None,
            status: DownloadStatus::Added,
            preferred_connection_count: None,
            speed_limit: 0,
            file_checksum: None,
        }
    }

    pub fn into_shared(self) -> SharedDownloadItem {
        Arc::new(parking_lot::RwLock::new(self))
    }

    pub fn link(&self) -> &str {
        &self.credentials.link
    }

    pub fn is_m3u8(&self) -> bool {
        self.credentials.m3u8
    }

    pub fn known_length(&self) -> Option<u64> {
        (self.content_length >= 0).then_some(self.content_length as u64)
    }

    /// Final output location, `<folder>/<name>`
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.folder).join(&self.name)
    }

    /// Copy every tracked field from `other`. Stream properties stay as they are.
    pub fn apply_from(&mut self, other: &DownloadItem) {
        let props = std::mem::take(&mut self.credentials.m3u8_props);
        self.credentials = DownloadCredentials {
            m3u8_props: props,
            ..other.credentials.clone()
        };

        self.id = other.id;
        self.folder = other.folder.clone();
        self.name = other.name.clone();

        self.content_length = other.content_length;
        self.server_etag = other.server_etag.clone();

        self.date_added = other.date_added;
        self.start_time = other.start_time;
        self.complete_time = other.complete_time;
        self.status = other.status;
        self.preferred_connection_count = other.preferred_connection_count;
        self.speed_limit = other.speed_limit;

        self.file_checksum = other.file_checksum.clone();
    }

    /// Re-point the job at new credentials, keeping its tracking history
    pub fn with_credentials(&mut self, credentials: &DownloadCredentials) -> &mut Self {
        self.credentials.link = credentials.link.clone();
        self.credentials.headers = credentials.headers.clone();
        self.credentials.username = credentials.username.clone();
        self.credentials.password = credentials.password.clone();
        self.credentials.download_page = credentials.download_page.clone();
        self.credentials.user_agent = credentials.user_agent.clone();
        self.credentials.m3u8 = credentials.m3u8;
        self.credentials.m3u8_props.extend(
            credentials
                .m3u8_props
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self
    }

    /// Move to `next`, stamping start/complete times
    pub fn transition_to(&mut self, next: DownloadStatus) -> DownloadResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::InvalidState(format!(
                "job {} cannot go from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        match next {
            DownloadStatus::Downloading if self.start_time.is_none() => {
                self.start_time = Some(Utc::now());
            }
            DownloadStatus::Completed => self.complete_time = Some(Utc::now()),
            _ => {}
        }
        tracing::debug!("job {}: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
        Ok(())
    }
}

/// One independently downloaded byte range.
///
/// `from` identifies the part within its job: the byte offset of the range for
/// single-file jobs, the 1-based segment number for playlist jobs. `to` and
/// `current` are positions in the file the part writes to, so the same range
/// can be requested from `link` as `bytes=current-to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub from: u64,
    /// Inclusive end, `None` means until EOF
    pub to: Option<u64>,
    /// Next byte to write
    pub current: u64,
    pub link: String,
}

impl Part {
    pub fn new(from: u64, to: Option<u64>, current: u64, link: impl Into<String>) -> Self {
        Self {
            from,
            to,
            current,
            link: link.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        match self.to {
            Some(to) => self.current > to,
            None => false,
        }
    }

    /// Bytes still missing, when the end is known
    pub fn remaining(&self) -> Option<u64> {
        self.to.map(|to| (to + 1).saturating_sub(self.current))
    }

    /// `Range` header value for the missing bytes of this part
    pub fn range_header(&self) -> Option<String> {
        match self.to {
            Some(to) => Some(format!("bytes={}-{}", self.current, to)),
            None if self.current > 0 => Some(format!("bytes={}-", self.current)),
            None => None,
        }
    }
}

/// Resolved playlist: aggregate probed length plus parts in manifest order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3u8Info {
    pub length: u64,
    pub parts: Vec<Part>,
}
