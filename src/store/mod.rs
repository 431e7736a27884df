//! Repository and catalog contracts consumed by the broadcast engine.
//!
//! Persistence engines and third-party catalogs live behind these traits; the
//! crate ships in-memory implementations (`memory`) and a JSON-file catalog
//! (`catalog`) so the station can run standalone.

pub mod catalog;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{HistoryEntry, HistoryId, NewRequest, Request, RequestId, RequestStatus, Track};

pub use catalog::StaticCatalog;
pub use memory::{MemoryHistory, MemoryRequestStore, MemoryTrackCache};

/// External source of track metadata and recommendations.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    async fn resolve(&self, track_id: &str) -> Result<Option<Track>>;

    async fn search(&self, query: &str) -> Result<Vec<Track>>;

    async fn recommend(&self, seed_track_ids: &[String]) -> Result<Vec<String>>;
}

/// Local cache of fetched track metadata plus play counters.
#[async_trait]
pub trait TrackCache: Send + Sync {
    async fn get(&self, track_id: &str) -> Result<Option<Track>>;

    async fn put(&self, track: &Track) -> Result<()>;

    async fn increment_play_count(&self, track_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn record_play(&self, track: &Track, submitter: Option<&str>) -> Result<HistoryId>;

    /// Entries played within the trailing window, newest first.
    async fn recently_played(&self, window_hours: i64) -> Result<Vec<HistoryEntry>>;

    /// One page (1-based) of history, newest first.
    async fn page(&self, page: usize, per_page: usize) -> Result<Vec<HistoryEntry>>;

    async fn page_count(&self, per_page: usize) -> Result<usize>;
}

/// Persisted listener requests and their lifecycle.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn insert(&self, track_id: &str, submitter: &str) -> Result<Request>;

    /// Atomically select the oldest `requested` entry and flip it to `pending`.
    async fn claim_oldest(&self) -> Result<Option<Request>>;

    /// Apply a lifecycle transition. Returns `false` when the request is
    /// unknown or the transition is not allowed from its current status.
    async fn transition(
        &self,
        id: RequestId,
        to: RequestStatus,
        history: Option<HistoryId>,
    ) -> Result<bool>;

    async fn count(&self, status: RequestStatus) -> Result<usize>;

    /// Entries with the given status, oldest first.
    async fn list(&self, status: RequestStatus) -> Result<Vec<Request>>;

    /// Whether the track has a `requested` or `pending` entry.
    async fn is_active(&self, track_id: &str) -> Result<bool>;

    async fn by_submitter_since(&self, submitter: &str, since: DateTime<Utc>) -> Result<Vec<Request>>;

    /// Drop every `requested`/`pending` entry and insert `requests` as `requested`.
    async fn replace_active(&self, requests: Vec<NewRequest>) -> Result<()>;

    /// Flip every `pending` entry back to `requested`. Returns how many moved.
    async fn reset_pending(&self) -> Result<usize>;
}
