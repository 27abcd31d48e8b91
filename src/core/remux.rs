//! Segment remuxing
//!
//! Turns a parts directory of `<n>.<ext>` segment files into one output file,
//! always in numeric segment order.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::config::{HlsSettings, RemuxStrategy};
use crate::core::error_handling::{check_cancelled, DownloadError, DownloadResult};

const CONCAT_LIST_NAME: &str = "concat.txt";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Combine every segment in `parts_dir` into `output` without re-encoding.
    /// Returns `Cancelled` as soon as possible once `cancel` fires.
    async fn remux(
        &self,
        parts_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> DownloadResult<()>;
}

/// Segment number embedded in `path`, if it is a `<n>.<extension>` file
pub fn segment_number(path: &Path, extension: &str) -> Option<u64> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Segment files of `dir` sorted by their number. Anything else in the
/// directory is ignored.
pub async fn sorted_segment_files(dir: &Path, extension: &str) -> DownloadResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut numbered = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(number) = segment_number(&path, extension) {
            numbered.push((number, path));
        }
    }
    numbered.sort_by_key(|(number, _)| *number);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

/// Runs the external `ffmpeg` binary with the concat demuxer in stream-copy mode
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg_path: String,
    extension: String,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            extension: extension.into(),
        }
    }

    /// One `file '<path>'` line per segment, quotes escaped for the concat demuxer
    pub fn concat_list(files: &[PathBuf]) -> String {
        files
            .iter()
            .map(|file| {
                let escaped = file.to_string_lossy().replace('\'', "'\\''");
                format!("file '{escaped}'\n")
            })
            .collect()
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(
        &self,
        parts_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let files = sorted_segment_files(parts_dir, &self.extension).await?;
        if files.is_empty() {
            return Err(DownloadError::Remux(format!(
                "no segments found in {}",
                parts_dir.display()
            )));
        }

        let list_path = parts_dir.join(CONCAT_LIST_NAME);
        tokio::fs::write(&list_path, Self::concat_list(&files)).await?;

        tracing::info!(
            "remuxing {} segments into {} with {}",
            files.len(),
            output.display(),
            self.ffmpeg_path
        );
        check_cancelled(cancel)?;
        let child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-map", "0", "-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::Remux(format!("failed to start {}: {e}", self.ffmpeg_path)))?;

        // 取消时丢弃 wait 的 future，kill_on_drop 会结束 ffmpeg 进程
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("remux into {} cancelled, stopping {}", output.display(), self.ffmpeg_path);
                return Err(DownloadError::Cancelled);
            }
            result = child.wait_with_output() => result?,
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(DownloadError::Remux(format!(
                "{} exited with {}: {}",
                self.ffmpeg_path,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Plain byte concatenation, valid for MPEG-TS segments
#[derive(Debug, Clone)]
pub struct ConcatRemuxer {
    extension: String,
}

impl ConcatRemuxer {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

#[async_trait]
impl Remuxer for ConcatRemuxer {
    async fn remux(
        &self,
        parts_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let files = sorted_segment_files(parts_dir, &self.extension).await?;
        tracing::info!("合并 {} 个片段到: {}", files.len(), output.display());
        check_cancelled(cancel)?;

        let mut output_file = File::create(output).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        for (index, segment) in files.iter().enumerate() {
            check_cancelled(cancel)?;
            tracing::debug!("合并片段 {}/{}: {:?}", index + 1, files.len(), segment);
            let mut input = File::open(segment).await?;
            loop {
                let read = input.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                output_file.write_all(&buffer[..read]).await?;
            }
        }
        output_file.flush().await?;
        output_file.sync_all().await?;
        Ok(())
    }
}

pub fn remuxer_for(settings: &HlsSettings) -> Arc<dyn Remuxer> {
    match settings.remux {
        RemuxStrategy::Ffmpeg => Arc::new(FfmpegRemuxer::new(
            settings.ffmpeg_path.clone(),
            settings.segment_extension.clone(),
        )),
        RemuxStrategy::Concat => Arc::new(ConcatRemuxer::new(settings.segment_extension.clone())),
    }
}

/// Remux, then drop the parts directory. On failure the parts directory is
/// kept so the job can be retried without downloading again.
pub async fn finish_remux(
    remuxer: &dyn Remuxer,
    parts_dir: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> DownloadResult<()> {
    if let Err(err) = remuxer.remux(parts_dir, output, cancel).await {
        tracing::warn!("remux failed, keeping {}: {}", parts_dir.display(), err);
        return Err(err);
    }
    tokio::fs::remove_dir_all(parts_dir).await?;
    tracing::info!("remuxed into {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FailingRemuxer;

    #[async_trait]
    impl Remuxer for FailingRemuxer {
        async fn remux(
            &self,
            _parts_dir: &Path,
            _output: &Path,
            _cancel: &CancellationToken,
        ) -> DownloadResult<()> {
            Err(DownloadError::Remux("boom".to_string()))
        }
    }

    fn write_segments(dir: &Path, names: &[(&str, &[u8])]) {
        for (name, body) in names {
            std::fs::write(dir.join(name), body).unwrap();
        }
    }

    #[test]
    fn test_segment_number() {
        assert_eq!(segment_number(Path::new("/p/12.ts"), "ts"), Some(12));
        assert_eq!(segment_number(Path::new("/p/12.ts.dec"), "ts"), None);
        assert_eq!(segment_number(Path::new("/p/concat.txt"), "ts"), None);
        assert_eq!(segment_number(Path::new("/p/abc.ts"), "ts"), None);
    }

    #[tokio::test]
    async fn test_sorted_numerically_not_lexically() {
        let dir = tempdir().unwrap();
        write_segments(
            dir.path(),
            &[("10.ts", b""), ("2.ts", b""), ("1.ts", b""), ("notes.txt", b"")],
        );

        let files = sorted_segment_files(dir.path(), "ts").await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["1.ts", "2.ts", "10.ts"]);
    }

    #[tokio::test]
    async fn test_concat_remux_and_cleanup() {
        let dir = tempdir().unwrap();
        let parts = dir.path().join("out.mp4-parts");
        std::fs::create_dir(&parts).unwrap();
        write_segments(&parts, &[("3.ts", b"cc"), ("1.ts", b"aa"), ("2.ts", b"bb")]);
        let output = dir.path().join("out.mp4");

        finish_remux(&ConcatRemuxer::new("ts"), &parts, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"aabbcc");
        assert!(!parts.exists());
    }

    #[tokio::test]
    async fn test_failed_remux_keeps_parts() {
        let dir = tempdir().unwrap();
        let parts = dir.path().join("out.mp4-parts");
        std::fs::create_dir(&parts).unwrap();
        write_segments(&parts, &[("1.ts", b"aa")]);

        let err = finish_remux(
            &FailingRemuxer,
            &parts,
            &dir.path().join("out.mp4"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::Remux(_)));
        assert!(parts.join("1.ts").exists());
    }

    #[tokio::test]
    async fn test_cancelled_remux_keeps_parts() {
        let dir = tempdir().unwrap();
        let parts = dir.path().join("out.mp4-parts");
        std::fs::create_dir(&parts).unwrap();
        write_segments(&parts, &[("1.ts", b"aa"), ("2.ts", b"bb")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        for remuxer in [
            Arc::new(ConcatRemuxer::new("ts")) as Arc<dyn Remuxer>,
            Arc::new(FfmpegRemuxer::new("/nonexistent/ffmpeg-binary", "ts")) as Arc<dyn Remuxer>,
        ] {
            let err = finish_remux(remuxer.as_ref(), &parts, &dir.path().join("out.mp4"), &cancel)
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
            assert!(parts.join("2.ts").exists());
        }
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_a_remux_error() {
        let dir = tempdir().unwrap();
        write_segments(dir.path(), &[("1.ts", b"aa")]);
        let remuxer = FfmpegRemuxer::new("/nonexistent/ffmpeg-binary", "ts");

        let err = remuxer
            .remux(dir.path(), &dir.path().join("out.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Remux(_)));
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = FfmpegRemuxer::concat_list(&[
            PathBuf::from("/p/1.ts"),
            PathBuf::from("/it's/2.ts"),
        ]);
        assert_eq!(list, "file '/p/1.ts'\nfile '/it'\\''s/2.ts'\n");
    }
}
