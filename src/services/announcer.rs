//! Spoken introductions placed ahead of each track.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::Track;

/// A track as the announcer talks about it.
#[derive(Debug, Clone, Copy)]
pub struct Introduction<'a> {
    pub track: &'a Track,
    pub submitter: Option<&'a str>,
}

impl<'a> Introduction<'a> {
    pub fn new(track: &'a Track, submitter: Option<&'a str>) -> Self {
        Self { track, submitter }
    }
}

#[async_trait]
pub trait Announcer: Send + Sync {
    /// Text introducing `current`, leading out of `previous` when known.
    async fn introduce(&self, current: Introduction<'_>, previous: Option<Introduction<'_>>) -> Result<String>;

    /// Render `text` to an audio file at `output`.
    async fn speak(&self, text: &str, output: &Path) -> Result<PathBuf>;
}

/// Title, artist, album, genres, release date and submitter of a track, one
/// field per line.
pub fn describe(label: &str, intro: &Introduction<'_>) -> String {
    let track = intro.track;
    let mut lines = vec![
        format!("{label}:"),
        format!("- Title: {}", track.title),
        format!("- Artist: {}", track.artist),
    ];
    if !track.album.is_empty() {
        lines.push(format!("- Album: {}", track.album));
    }
    if !track.genres.is_empty() {
        lines.push(format!("- Genres: {}", track.genres.join(", ")));
    }
    if let Some(date) = &track.release_date {
        lines.push(format!("- Release date: {date}"));
    }
    if let Some(submitter) = intro.submitter {
        lines.push(format!("- Suggested by: {submitter}"));
    }
    lines.join("\n")
}

/// Material describing the current and previous track, suitable as a prompt
/// for a text generator.
pub fn prompt_material(current: &Introduction<'_>, previous: Option<&Introduction<'_>>) -> String {
    match previous {
        Some(previous) => format!("{}\n\n{}", describe("Current song", current), describe("Previous song", previous)),
        None => describe("Current song", current),
    }
}

/// Template introductions spoken through an external text-to-speech command.
///
/// The command line is split on whitespace; `{text}` and `{output}` are
/// substituted per argument, e.g. `espeak-ng -w {output} {text}`.
pub struct CommandAnnouncer {
    command: Vec<String>,
}

impl CommandAnnouncer {
    pub fn new(command_line: &str) -> Result<Self> {
        let command: Vec<String> = command_line.split_whitespace().map(String::from).collect();
        if command.is_empty() {
            return Err(AppError::BadRequest("empty text-to-speech command".into()));
        }
        Ok(Self { command })
    }

    fn args(&self, text: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.command[1..]
            .iter()
            .map(|arg| arg.replace("{text}", text).replace("{output}", &output))
            .collect()
    }
}

fn spoken_line(intro: &Introduction<'_>) -> String {
    let track = intro.track;
    let mut line = format!("{} by {}", track.title, track.artist);
    if !track.album.is_empty() {
        line.push_str(&format!(", off {}", track.album));
    }
    if let Some(year) = track.release_date.as_deref().and_then(|d| d.get(..4)) {
        line.push_str(&format!(" from {year}"));
    }
    line
}

#[async_trait]
impl Announcer for CommandAnnouncer {
    async fn introduce(&self, current: Introduction<'_>, previous: Option<Introduction<'_>>) -> Result<String> {
        debug!("Announcement material:\n{}", prompt_material(&current, previous.as_ref()));

        let mut text = String::new();
        if let Some(previous) = &previous {
            text.push_str(&format!("That was {}. ", spoken_line(previous)));
        }
        text.push_str(&format!("Up next, {}.", spoken_line(&current)));
        if let Some(submitter) = current.submitter {
            text.push_str(&format!(" Requested by {submitter}."));
        }
        Ok(text)
    }

    async fn speak(&self, text: &str, output: &Path) -> Result<PathBuf> {
        info!("Speaking announcement: {}", text);
        let out = Command::new(&self.command[0])
            .args(self.args(text, output))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(AppError::Storage(format!("tts exited with {}: {}", out.status, stderr.trim())));
        }
        Ok(output.to_path_buf())
    }
}
