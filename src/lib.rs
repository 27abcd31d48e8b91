//! Video Segment Downloader - Core Library
//!
//! Segmented, resumable downloads of plain files and HLS media playlists:
//! parallel ranged parts, AES-128 segment decryption and remuxing into a
//! single output file.

pub mod core;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    client::{DownloaderClient, HttpDownloaderClient},
    config::EngineConfig,
    destination::{DownloadDestination, SingleFileDestination},
    engine::DownloadJob,
    error_handling::{DownloadError, DownloadResult},
    hls_destination::HlsDownloadDestination,
    models::{DownloadCredentials, DownloadItem, DownloadStatus, Part},
    playlist::PlaylistResolver,
    remux::{ConcatRemuxer, FfmpegRemuxer, Remuxer},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    utils::logging::init_tracing();
    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "video-segment-downloader");
    }
}
