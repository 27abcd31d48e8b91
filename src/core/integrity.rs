//! Whole-file checksum verification for completed single-file jobs.
//!
//! Checksums are written as `<algorithm>:<hex digest>`; the digest is computed
//! on the blocking pool with a streaming read.

use digest::DynDigest;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::core::error_handling::{DownloadError, DownloadResult};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Some(Self::Md5),
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn hasher(self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(Md5::new()),
            Self::Sha1 => Box::new(Sha1::new()),
            Self::Sha256 => Box::new(Sha256::new()),
            Self::Sha512 => Box::new(Sha512::new()),
        }
    }
}

/// Split `sha256:abcd...` into algorithm and lower-case digest
pub fn parse_checksum(checksum: &str) -> DownloadResult<(HashAlgorithm, String)> {
    let (name, digest) = checksum.split_once(':').ok_or_else(|| {
        DownloadError::Configuration(format!("checksum {checksum:?} is not <algorithm>:<hex>"))
    })?;
    let algorithm = HashAlgorithm::from_name(name)
        .ok_or_else(|| DownloadError::Configuration(format!("unknown hash algorithm {name}")))?;
    Ok((algorithm, digest.trim().to_ascii_lowercase()))
}

pub async fn compute_digest(path: &Path, algorithm: HashAlgorithm) -> DownloadResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> DownloadResult<String> {
        let mut reader = BufReader::new(File::open(&path)?);
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| DownloadError::InvalidState(format!("hash task failed: {e}")))?
}

pub async fn verify_checksum(path: &Path, checksum: &str) -> DownloadResult<()> {
    let (algorithm, expected) = parse_checksum(checksum)?;
    let actual = compute_digest(path, algorithm).await?;
    if actual != expected {
        return Err(DownloadError::Integrity { expected, actual });
    }
    Ok(())
}
