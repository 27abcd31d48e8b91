//! Core download engine
//!
//! Transport, destinations, playlist resolution, decryption, remuxing and the
//! job runner that ties them together.

pub mod bandwidth;
pub mod client;
pub mod config;
pub mod decryption;
pub mod destination;
pub mod engine;
pub mod error_handling;
pub mod hls_destination;
pub mod integrity;
pub mod models;
pub mod playlist;
pub mod remux;
pub mod single_flight;

#[cfg(test)]
pub(crate) mod test_support;



// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::DownloadJob;
