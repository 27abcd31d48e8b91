//! Stream key resolution and segment decryption.
//!
//! The playlist resolver records the key context of the first encrypted
//! segment in the job's stream properties; once every segment is on disk this
//! module fetches the key and replaces the segment files with their plaintext.

use aes::Aes128;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::core::client::DownloaderClient;
use crate::core::error_handling::{cancellable, check_cancelled, DownloadError, DownloadResult};
use crate::core::models::{
    DownloadCredentials, SEG_KEY_IV, SEG_KEY_METHOD, SEG_KEY_URI, SEG_MEDIA_SEQUENCE,
};
use crate::core::remux::segment_number;

type Aes128CbcDec = Decryptor<Aes128>;

/// Present once every segment of the directory has a staged plaintext
const COMMIT_MARKER: &str = ".decrypted";
const STAGED_SUFFIX: &str = ".dec";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKeyMethod {
    None,
    Aes128,
    Other(String),
}

impl StreamKeyMethod {
    pub fn parse(method: &str) -> Self {
        match method.trim().to_ascii_uppercase().as_str() {
            "NONE" | "" => Self::None,
            "AES-128" => Self::Aes128,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Key context of a job, read back from its stream properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub uri: String,
    pub method: StreamKeyMethod,
    pub iv: Option<String>,
    pub media_sequence: u64,
}

impl StreamKey {
    /// `None` when the job carries no key URI
    pub fn from_props(props: &HashMap<String, String>) -> Option<Self> {
        let uri = props.get(SEG_KEY_URI).filter(|uri| !uri.is_empty())?;
        Some(Self {
            uri: uri.clone(),
            method: StreamKeyMethod::parse(props.get(SEG_KEY_METHOD).map(String::as_str).unwrap_or("")),
            iv: props.get(SEG_KEY_IV).filter(|iv| !iv.is_empty()).cloned(),
            media_sequence: props
                .get(SEG_MEDIA_SEQUENCE)
                .and_then(|seq| seq.parse().ok())
                .unwrap_or(0),
        })
    }

    /// IV for segment number `segment` (1-based): the declared IV, or the
    /// segment's media sequence number when the manifest declares none
    pub fn iv_for(&self, segment: u64) -> DownloadResult<[u8; 16]> {
        match &self.iv {
            Some(iv) => parse_iv(iv),
            None => Ok(sequence_iv(
                self.media_sequence + segment.saturating_sub(1),
            )),
        }
    }
}

/// Decode a `0x`-prefixed 128-bit hex IV
pub fn parse_iv(iv: &str) -> DownloadResult<[u8; 16]> {
    let trimmed = iv.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let decoded = hex::decode(hex_part)
        .map_err(|e| DownloadError::Decryption(format!("IV {iv:?} is not hex: {e}")))?;
    decoded
        .try_into()
        .map_err(|bytes: Vec<u8>| {
            DownloadError::Decryption(format!("IV must be 16 bytes, got {}", bytes.len()))
        })
}

pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// AES-128-CBC with PKCS#7 padding
pub fn decrypt_aes128(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> DownloadResult<Vec<u8>> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| DownloadError::Decryption("AES-128 decryption failed: bad padding".to_string()))
}

/// Fetch the key through the job's transport, reusing its credentials
pub async fn fetch_key(
    client: &dyn DownloaderClient,
    credentials: &DownloadCredentials,
    key_uri: &str,
) -> DownloadResult<[u8; 16]> {
    tracing::debug!("fetching stream key {}", key_uri);
    let bytes = client
        .connect(&credentials.with_link(key_uri), None, None)
        .await?
        .read_to_end()
        .await?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        DownloadError::Decryption(format!("AES-128 key must be 16 bytes, got {}", bytes.len()))
    })
}

/// Decrypt every segment file in `parts_dir` according to the job's key
/// context. Returns the number of segment files covered.
///
/// The pass is all-or-nothing: each segment is first decrypted into a staged
/// `<n>.<ext>.dec` file next to it. Only when every segment is staged is the
/// commit marker written and the staged files moved over the ciphertext. A
/// failed or cancelled pass leaves the ciphertext untouched and keeps what it
/// staged, so the next pass picks up where it stopped.
pub async fn decrypt_segments(
    client: &dyn DownloaderClient,
    credentials: &DownloadCredentials,
    parts_dir: &Path,
    extension: &str,
    cancel: &CancellationToken,
) -> DownloadResult<usize> {
    let Some(stream_key) = StreamKey::from_props(&credentials.m3u8_props) else {
        return Ok(0);
    };

    match &stream_key.method {
        StreamKeyMethod::None => Ok(0),
        StreamKeyMethod::Aes128 => {
            let segments = segment_files(parts_dir, extension).await?;
            let marker = parts_dir.join(COMMIT_MARKER);

            if tokio::fs::try_exists(&marker).await? {
                tracing::debug!("resuming decryption commit in {}", parts_dir.display());
            } else {
                let key = cancellable(cancel, fetch_key(client, credentials, &stream_key.uri)).await?;
                stage_segments(&stream_key, &key, &segments, cancel).await?;
                tokio::fs::write(&marker, b"").await?;
            }

            for (_, path) in &segments {
                let staged = staged_path(path);
                if tokio::fs::try_exists(&staged).await? {
                    tokio::fs::rename(&staged, path).await?;
                }
            }
            tracing::info!(
                "decrypted {} segments in {}",
                segments.len(),
                parts_dir.display()
            );
            Ok(segments.len())
        }
        StreamKeyMethod::Other(method) => Err(DownloadError::UnsupportedKeyMethod {
            method: method.clone(),
        }),
    }
}

/// Drop decryption progress tied to `segment`, which is about to be written
/// again with ciphertext
pub async fn discard_decryption(parts_dir: &Path, segment: &Path) -> DownloadResult<()> {
    remove_if_exists(&staged_path(segment)).await?;
    remove_if_exists(&parts_dir.join(COMMIT_MARKER)).await
}

/// `<segment>.dec`
pub fn staged_path(segment: &Path) -> PathBuf {
    let mut staged = segment.as_os_str().to_os_string();
    staged.push(STAGED_SUFFIX);
    PathBuf::from(staged)
}

async fn segment_files(dir: &Path, extension: &str) -> DownloadResult<Vec<(u64, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(number) = segment_number(&path, extension) {
            files.push((number, path));
        }
    }
    files.sort_by_key(|(number, _)| *number);
    Ok(files)
}

async fn stage_segments(
    stream_key: &StreamKey,
    key: &[u8; 16],
    segments: &[(u64, PathBuf)],
    cancel: &CancellationToken,
) -> DownloadResult<()> {
    for (number, path) in segments {
        check_cancelled(cancel)?;
        let staged = staged_path(path);
        if tokio::fs::try_exists(&staged).await? {
            continue;
        }
        let iv = stream_key.iv_for(*number)?;
        stage_segment(path, &staged, key, &iv).await?;
    }
    Ok(())
}

/// Whole-file decrypt into `staged`, renamed into place so a staged file is
/// never half written
async fn stage_segment(
    path: &Path,
    staged: &Path,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> DownloadResult<()> {
    let ciphertext = tokio::fs::read(path).await?;
    let plaintext = decrypt_aes128(&ciphertext, key, iv)
        .map_err(|e| DownloadError::Decryption(format!("{}: {e}", path.display())))?;

    let mut temp = staged.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, &plaintext).await?;
    tokio::fs::rename(&temp, staged).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> DownloadResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
pub(crate) fn encrypt_aes128(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    use cipher::BlockEncryptMut;
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}
