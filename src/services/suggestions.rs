//! Refills the suggestion tier when nothing else is queued.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::queue::QueueService;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::store::{HistoryRepository, TrackCatalog};

const SEED_COUNT: usize = 5;

pub struct Suggester {
    catalog: Arc<dyn TrackCatalog>,
    history: Arc<dyn HistoryRepository>,
    fallback_seeds: Vec<String>,
    batch: usize,
    exclusion_hours: i64,
    timeout: Duration,
}

impl Suggester {
    pub fn new(catalog: Arc<dyn TrackCatalog>, history: Arc<dyn HistoryRepository>, config: &Config) -> Self {
        Self {
            catalog,
            history,
            fallback_seeds: config.initial_track_ids.clone(),
            batch: config.suggestion_batch,
            exclusion_hours: config.suggestion_exclusion_hours,
            timeout: config.network_timeout(),
        }
    }

    /// Ask the catalog for tracks like the most recent plays and append a small
    /// batch to the suggestion tier. Returns how many were added.
    pub async fn populate(&self, queue: &QueueService) -> Result<usize> {
        let mut seeds: Vec<String> = self
            .history
            .page(1, SEED_COUNT)
            .await?
            .into_iter()
            .map(|entry| entry.track_id)
            .collect();
        if seeds.is_empty() {
            seeds = self.fallback_seeds.iter().take(SEED_COUNT).cloned().collect();
        }

        let candidates = tokio::time::timeout(self.timeout, self.catalog.recommend(&seeds))
            .await
            .map_err(|_| AppError::Catalog(format!("recommendations timed out after {:?}", self.timeout)))??;

        let recent: HashSet<String> = self
            .history
            .recently_played(self.exclusion_hours)
            .await?
            .into_iter()
            .map(|entry| entry.track_id)
            .collect();

        let mut added = 0;
        for track_id in candidates.iter().filter(|id| !recent.contains(*id)) {
            if added >= self.batch {
                break;
            }
            if queue.is_track_already_queued(track_id).await? {
                continue;
            }
            if !queue.suggest(track_id) {
                break;
            }
            added += 1;
        }

        if added == 0 {
            warn!("No suggestions available from {} candidates", candidates.len());
        } else {
            info!("Added {} suggestions", added);
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Track;
    use crate::services::events::Signals;
    use crate::store::{MemoryHistory, MemoryRequestStore, StaticCatalog};

    fn track(id: &str) -> Track {
        serde_json::from_value(serde_json::json!({"id": id, "title": id, "artist": "a"})).unwrap()
    }

    fn queue() -> QueueService {
        QueueService::new(Arc::new(MemoryRequestStore::new()), Arc::new(Signals::new()), &Config::default())
    }

    #[tokio::test]
    async fn adds_small_batch_excluding_recent_plays() {
        let catalog = Arc::new(StaticCatalog::new(vec![track("a"), track("b"), track("c"), track("d")]));
        let history = Arc::new(MemoryHistory::new());
        history.record_play(&track("a"), None).await.unwrap();

        let suggester = Suggester::new(catalog, history, &Config::default());
        let queue = queue();
        assert_eq!(suggester.populate(&queue).await.unwrap(), 2);

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.suggestions.len(), 2);
        assert!(snapshot.suggestions.iter().all(|e| e.track_id != "a" && e.is_suggestion()));
    }

    #[tokio::test]
    async fn nothing_left_after_exclusions() {
        let catalog = Arc::new(StaticCatalog::new(vec![track("a"), track("b")]));
        let history = Arc::new(MemoryHistory::new());
        history.record_play(&track("b"), None).await.unwrap();
        history.record_play(&track("a"), None).await.unwrap();

        let suggester = Suggester::new(catalog, history, &Config::default());
        assert_eq!(suggester.populate(&queue()).await.unwrap(), 0);
    }
}
