use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::proxy::ProxyEndpoint;
use crate::error::{AppError, Result};

/// Fetches source audio to a local MP3 file.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` to `output`, optionally through `proxy`. Returns the
    /// path actually written.
    async fn fetch(&self, url: &str, proxy: Option<&ProxyEndpoint>, output: &Path) -> Result<PathBuf>;
}

/// Shells out to yt-dlp and extracts best audio as MP3.
pub struct YtDlpDownloader {
    bin: String,
}

impl YtDlpDownloader {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn fetch(&self, url: &str, proxy: Option<&ProxyEndpoint>, output: &Path) -> Result<PathBuf> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--no-playlist")
            .arg("--quiet")
            .arg("-x")
            .arg("-f").arg("bestaudio")
            .arg("--audio-format").arg("mp3")
            .arg("--output").arg(output);
        if let Some(proxy) = proxy {
            cmd.arg("--proxy").arg(proxy.url());
        }
        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} for {}", self.bin, url);
        let out = cmd.output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(AppError::Storage(format!(
                "{} exited with {}: {}",
                self.bin,
                out.status,
                stderr.trim()
            )));
        }

        if !tokio::fs::try_exists(output).await? {
            return Err(AppError::Storage(format!(
                "{} reported success but {} is missing",
                self.bin,
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}
