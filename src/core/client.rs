//! Transport boundary
//!
//! The engine only ever calls two operations on the transport: a ranged (or
//! full) fetch and a length-only probe. [`HttpDownloaderClient`] is the
//! reqwest-backed implementation; tests plug in their own.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE, REFERER, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::DownloadSettings;
use crate::core::error_handling::{DownloadError, DownloadResult};
use crate::core::models::DownloadCredentials;

/// Body of a fetch, consumed chunk by chunk
pub type ByteStream = BoxStream<'static, DownloadResult<Bytes>>;

/// Status and headers of a response. Header names are lower-case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl ResponseInfo {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Length of the whole resource: the `content-range` total when present,
    /// otherwise `content-length`
    pub fn total_length(&self) -> Option<u64> {
        if let Some(total) = self
            .header("content-range")
            .and_then(|range| range.rsplit('/').next())
            .and_then(|total| total.trim().parse::<u64>().ok())
        {
            return Some(total);
        }
        self.header("content-length")
            .and_then(|len| len.trim().parse::<u64>().ok())
    }

    pub fn supports_range(&self) -> bool {
        self.status_code == StatusCode::PARTIAL_CONTENT.as_u16()
            || self
                .header("accept-ranges")
                .map(|v| v.to_ascii_lowercase().contains("bytes"))
                .unwrap_or(false)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.headers.remove("content-range");
        self.headers
            .insert("content-length".to_string(), length.to_string());
    }

    fn from_reqwest(status: StatusCode, headers: &HeaderMap) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            status_code: status.as_u16(),
            headers,
        }
    }
}

/// An open fetch
pub struct Connection {
    pub source: ByteStream,
    pub response_info: ResponseInfo,
}

impl Connection {
    /// Drain the body into memory. Only for small resources such as manifests and keys.
    pub async fn read_to_end(mut self) -> DownloadResult<Vec<u8>> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.source.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer)
    }
}

#[async_trait]
pub trait DownloaderClient: Send + Sync {
    /// Fetch `credentials.link`, optionally restricted to `range_start..=range_end`
    async fn connect(
        &self,
        credentials: &DownloadCredentials,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> DownloadResult<Connection>;

    /// Probe the resource without downloading its body
    async fn test(&self, credentials: &DownloadCredentials) -> DownloadResult<ResponseInfo>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpDownloaderClient {
    client: Client,
}

impl HttpDownloaderClient {
    pub fn new(settings: &DownloadSettings) -> DownloadResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .connect_timeout(Duration::from_secs(settings.timeout_seconds.min(30)))
            .user_agent(&settings.user_agent)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn apply_credentials(
        &self,
        mut request: RequestBuilder,
        credentials: &DownloadCredentials,
    ) -> DownloadResult<RequestBuilder> {
        if let Some(headers) = &credentials.headers {
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| DownloadError::Configuration(format!("header {name}: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| DownloadError::Configuration(format!("header value: {e}")))?;
                map.insert(name, value);
            }
            request = request.headers(map);
        }
        if let Some(username) = &credentials.username {
            request = request.basic_auth(username, credentials.password.as_ref());
        }
        if let Some(page) = &credentials.download_page {
            request = request.header(REFERER, page);
        }
        if let Some(agent) = &credentials.user_agent {
            request = request.header(USER_AGENT, agent);
        }
        Ok(request)
    }

    fn check_status(link: &str, status: StatusCode) -> DownloadResult<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(DownloadError::protocol(
                format!("{link} responded {status}"),
                Some(status.as_u16()),
            ))
        }
    }
}

#[async_trait]
impl DownloaderClient for HttpDownloaderClient {
    async fn connect(
        &self,
        credentials: &DownloadCredentials,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> DownloadResult<Connection> {
        let mut request = self.apply_credentials(self.client.get(&credentials.link), credentials)?;
        match (range_start, range_end) {
            (Some(start), Some(end)) => {
                request = request.header(RANGE, format!("bytes={start}-{end}"));
            }
            (Some(start), None) if start > 0 => {
                request = request.header(RANGE, format!("bytes={start}-"));
            }
            _ => {}
        }

        let response = request.send().await?;
        let status = response.status();
        Self::check_status(&credentials.link, status)?;
        let response_info = ResponseInfo::from_reqwest(status, response.headers());

        let source = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed();

        Ok(Connection {
            source,
            response_info,
        })
    }

    async fn test(&self, credentials: &DownloadCredentials) -> DownloadResult<ResponseInfo> {
        let response = self
            .apply_credentials(self.client.head(&credentials.link), credentials)?
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let info = ResponseInfo::from_reqwest(status, response.headers());
            if info.total_length().is_some() {
                return Ok(info);
            }
        }

        // Some servers answer HEAD without a length (or not at all); ask for one byte instead.
        tracing::debug!("HEAD gave no length for {}, probing with a ranged GET", credentials.link);
        let response = self
            .apply_credentials(self.client.get(&credentials.link), credentials)?
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = response.status();
        Self::check_status(&credentials.link, status)?;
        Ok(ResponseInfo::from_reqwest(status, response.headers()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_length_prefers_content_range() {
        let info = ResponseInfo::new(206)
            .with_header("Content-Length", "1")
            .with_header("Content-Range", "bytes 0-0/4096");
        assert_eq!(info.total_length(), Some(4096));
        assert!(info.supports_range());

        let plain = ResponseInfo::new(200).with_header("content-length", "150");
        assert_eq!(plain.total_length(), Some(150));
        assert!(!plain.supports_range());
    }

    #[test]
    fn test_set_content_length_overrides() {
        let mut info = ResponseInfo::new(200)
            .with_header("content-length", "512")
            .with_header("etag", "\"abc\"");
        info.set_content_length(370);
        assert_eq!(info.total_length(), Some(370));
        assert_eq!(info.etag(), Some("\"abc\""));
    }

    #[test]
    fn test_unknown_length() {
        let info = ResponseInfo::new(200).with_header("content-range", "bytes 0-0/*");
        assert_eq!(info.total_length(), None);
        assert!(info.is_success());
        assert!(!ResponseInfo::new(404).is_success());
    }

    #[tokio::test]
    async fn test_read_to_end_joins_chunks() {
        let chunks: Vec<DownloadResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let connection = Connection {
            source: futures_util::stream::iter(chunks).boxed(),
            response_info: ResponseInfo::new(200),
        };
        assert_eq!(connection.read_to_end().await.unwrap(), b"abcd".to_vec());
    }
}
