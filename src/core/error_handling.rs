//! Error taxonomy and retry policy for the segment download engine
//!
//! Every fallible operation in the engine returns [`DownloadResult`]. Errors are
//! classified so the job runner can decide whether a part is worth retrying and
//! which failures must move the job into the `Error` state.
//!
//! Key features:
//! - Setup / cache-miss / unsupported-key-method / remux failures are fatal
//! - Network and 5xx protocol failures are retryable per part
//! - Exponential backoff with jitter

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default base delay for exponential backoff (500ms)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Error categories for the download engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// DNS, connection, timeout
    Network,
    /// HTTP status codes, malformed responses
    Protocol,
    /// Permissions, disk space, IO
    FileSystem,
    /// Manifest parsing and format errors
    Parsing,
    /// Stream key resolution and decryption
    Encryption,
    /// External muxing tool
    Remux,
    /// Checksum mismatches
    DataIntegrity,
    /// Misuse of the engine (illegal transitions, cache misses)
    Usage,
    /// Invalid settings
    Configuration,
    /// Cancelled by the caller
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The output directory could not be created or is not a directory.
    #[error("Setup failed for {path}: {message}")]
    Setup { path: String, message: String },

    /// Part list requested without a preceding successful playlist parse.
    #[error("No resolved playlist for {link}; parse the manifest before resolving parts")]
    CacheMiss { link: String },

    #[error("Key method {method} is not supported")]
    UnsupportedKeyMethod { method: String },

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Remux failed: {0}")]
    Remux(String),

    #[error("Protocol error: {message} (code: {code:?})")]
    Protocol { message: String, code: Option<u16> },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        Self::Parse(format!("invalid URL: {err}"))
    }
}

impl DownloadError {
    pub fn protocol(message: impl Into<String>, code: Option<u16>) -> Self {
        Self::Protocol {
            message: message.into(),
            code,
        }
    }

    pub fn setup(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Setup {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Determine if a part that failed with this error should be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(err) => !err.is_builder(),
            Self::Protocol { code, .. } => match code {
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
                None => true,
            },
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Setup { .. } | Self::Io(_) => ErrorCategory::FileSystem,
            Self::CacheMiss { .. } | Self::InvalidState(_) => ErrorCategory::Usage,
            Self::UnsupportedKeyMethod { .. } | Self::Decryption(_) => ErrorCategory::Encryption,
            Self::Remux(_) => ErrorCategory::Remux,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Network(_) => ErrorCategory::Network,
            Self::Parse(_) => ErrorCategory::Parsing,
            Self::Integrity { .. } => ErrorCategory::DataIntegrity,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

/// Run `work` unless `cancel` fires first; the work future is dropped on cancel
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = DownloadResult<T>>,
) -> DownloadResult<T> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        result = work => result,
    }
}

pub fn check_cancelled(cancel: &CancellationToken) -> DownloadResult<()> {
    if cancel.is_cancelled() {
        Err(DownloadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Retry strategy for a single part
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0), 0 disables jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = Duration::from_millis(delay_ms as u64);

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter_factor > 0.0 {
            let jitter =
                delay.as_millis() as f64 * self.jitter_factor * (rand::random::<f64>() - 0.5);
            let jittered_delay = delay.as_millis() as i64 + jitter as i64;
            delay = Duration::from_millis(jittered_delay.max(0) as u64);
        }

        delay
    }
}
