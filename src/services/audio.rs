//! Joining announcement and track audio, and scratch-file hygiene.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::utils::mp3::id3v2_len;

/// Writes `first` followed by `second` into `output`.
#[async_trait]
pub trait AudioJoiner: Send + Sync {
    async fn join(&self, first: &Path, second: &Path, output: &Path) -> Result<()>;
}

/// Re-encodes through ffmpeg's concat filter, so inputs may differ in format.
pub struct FfmpegJoiner {
    bin: String,
}

impl FfmpegJoiner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl AudioJoiner for FfmpegJoiner {
    async fn join(&self, first: &Path, second: &Path, output: &Path) -> Result<()> {
        let out = Command::new(&self.bin)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-i").arg(first)
            .arg("-i").arg(second)
            .arg("-filter_complex").arg("[0:a][1:a]concat=n=2:v=0:a=1[out]")
            .arg("-map").arg("[out]")
            .arg(output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(AppError::Storage(format!("ffmpeg exited with {}: {}", out.status, stderr.trim())));
        }
        Ok(())
    }
}

/// Byte-level MP3 concatenation. Frames are self-delimiting, so the second
/// file only needs its ID3v2 tag stripped.
pub struct FrameJoiner;

#[async_trait]
impl AudioJoiner for FrameJoiner {
    async fn join(&self, first: &Path, second: &Path, output: &Path) -> Result<()> {
        let mut joined = fs::read(first).await?;
        let tail = fs::read(second).await?;
        let skip = id3v2_len(&tail).min(tail.len());
        joined.extend_from_slice(&tail[skip..]);
        fs::write(output, joined).await?;
        Ok(())
    }
}

pub fn joiner_from_config(config: &Config) -> Arc<dyn AudioJoiner> {
    if config.ffmpeg_bin.trim().is_empty() {
        info!("No ffmpeg configured, joining MP3 frames directly");
        Arc::new(FrameJoiner)
    } else {
        Arc::new(FfmpegJoiner::new(config.ffmpeg_bin.clone()))
    }
}

/// Delete a scratch file, logging instead of failing.
pub async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Delete every file in `dir` whose name starts with `stem`; downloaders leave
/// `.part` and intermediate container files next to the target.
pub async fn remove_partials(dir: &Path, stem: &str) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {} for partial downloads: {}", dir.display(), e);
            return 0;
        }
    };

    let mut doomed: Vec<PathBuf> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(stem) {
            doomed.push(entry.path());
        }
    }

    for path in &doomed {
        remove_quietly(path).await;
    }
    doomed.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_joiner_strips_tag_of_second_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("intro.mp3");
        let second = dir.path().join("song.mp3");
        let output = dir.path().join("combined.mp3");

        fs::write(&first, b"INTRO").await.unwrap();
        let mut song = b"ID3\x04\x00\x00\x00\x00\x00\x02xx".to_vec();
        song.extend_from_slice(b"SONG");
        fs::write(&second, &song).await.unwrap();

        FrameJoiner.join(&first, &second, &output).await.unwrap();
        assert_eq!(fs::read(&output).await.unwrap(), b"INTROSONG");
    }

    #[tokio::test]
    async fn removes_only_matching_partials() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["abc.mp3", "abc.mp3.part", "abc.webm", "other.mp3"] {
            fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        assert_eq!(remove_partials(dir.path(), "abc").await, 3);
        assert!(dir.path().join("other.mp3").exists());
        assert!(!dir.path().join("abc.mp3.part").exists());
    }

    #[tokio::test]
    async fn removing_missing_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        remove_quietly(&dir.path().join("gone.mp3")).await;
    }
}
