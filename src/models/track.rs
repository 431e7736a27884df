use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::RequestId;

/// Platform key in `Track::urls` that points at downloadable source audio.
pub const SOURCE_PLATFORM: &str = "youtube";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub art_url: Option<String>,
    /// Per-platform external urls, e.g. `{"spotify": ..., "youtube": ...}`.
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

impl Track {
    pub fn source_url(&self) -> Option<&str> {
        self.urls
            .get(SOURCE_PLATFORM)
            .map(String::as_str)
            .filter(|url| !url.trim().is_empty())
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// Entry of the request or suggestion tier. `submitter == None` marks a suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub track_id: String,
    pub submitter: Option<String>,
    #[serde(default)]
    pub request: Option<RequestId>,
}

impl QueueEntry {
    pub fn suggestion(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            submitter: None,
            request: None,
        }
    }

    pub fn is_suggestion(&self) -> bool {
        self.submitter.is_none()
    }
}
