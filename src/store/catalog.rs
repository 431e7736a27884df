use std::path::Path;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::fs;
use tracing::{info, warn};

use super::TrackCatalog;
use crate::config::SEARCH_LIMIT;
use crate::error::Result;
use crate::models::Track;

const RECOMMENDATION_LIMIT: usize = 15;

/// Track catalog backed by a JSON array of tracks on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tracks: Vec<Track>,
}

impl StaticCatalog {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self { tracks }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Catalog file {} not found, starting with an empty catalog", path.display());
            return Ok(Self::default());
        }

        let data = fs::read_to_string(path).await?;
        let tracks: Vec<Track> = serde_json::from_str(&data)?;
        info!("Loaded {} catalog tracks from {}", tracks.len(), path.display());

        for track in tracks.iter().filter(|track| track.source_url().is_none()) {
            warn!("  {} has no source url and will be skipped if queued", track.display_name());
        }

        Ok(Self { tracks })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[async_trait]
impl TrackCatalog for StaticCatalog {
    async fn resolve(&self, track_id: &str) -> Result<Option<Track>> {
        Ok(self.tracks.iter().find(|track| track.id == track_id).cloned())
    }

    async fn search(&self, query: &str) -> Result<Vec<Track>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .tracks
            .iter()
            .filter(|track| {
                track.title.to_lowercase().contains(&needle)
                    || track.artist.to_lowercase().contains(&needle)
                    || track.album.to_lowercase().contains(&needle)
            })
            .take(SEARCH_LIMIT)
            .cloned()
            .collect())
    }

    async fn recommend(&self, seed_track_ids: &[String]) -> Result<Vec<String>> {
        let mut candidates: Vec<String> = self
            .tracks
            .iter()
            .filter(|track| !seed_track_ids.contains(&track.id))
            .map(|track| track.id.clone())
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(RECOMMENDATION_LIMIT);
        Ok(candidates)
    }
}
