//! The three queue tiers: persisted requests, in-memory suggestions, and the
//! buffer of prepared audio.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::events::Signals;
use crate::config::Config;
use crate::error::Result;
use crate::models::{HistoryId, NewRequest, PreparedAudio, QueueEntry, Request, RequestId, RequestStatus, Track};
use crate::store::RequestRepository;

#[derive(Default)]
struct Tiers {
    suggestions: VecDeque<QueueEntry>,
    buffer: VecDeque<PreparedAudio>,
    /// Track the gatherer is currently preparing.
    downloading: Option<String>,
    /// Entry the player is currently broadcasting.
    playing: Option<PreparedAudio>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferedTrack {
    pub track: Track,
    pub submitter: Option<String>,
}

impl From<&PreparedAudio> for BufferedTrack {
    fn from(audio: &PreparedAudio) -> Self {
        Self {
            track: audio.track.clone(),
            submitter: audio.submitter.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub requests: Vec<Request>,
    pub suggestions: Vec<QueueEntry>,
    pub buffer: Vec<BufferedTrack>,
}

pub struct QueueService {
    requests: Arc<dyn RequestRepository>,
    tiers: Mutex<Tiers>,
    /// Serialises `dequeue_next` so a request is claimed by one caller only.
    dequeue: tokio::sync::Mutex<()>,
    signals: Arc<Signals>,
    suggestion_cap: usize,
    request_cap: usize,
    preload_threshold: usize,
}

impl QueueService {
    pub fn new(requests: Arc<dyn RequestRepository>, signals: Arc<Signals>, config: &Config) -> Self {
        Self {
            requests,
            tiers: Mutex::new(Tiers::default()),
            dequeue: tokio::sync::Mutex::new(()),
            signals,
            suggestion_cap: config.suggestion_cap,
            request_cap: config.request_cap,
            preload_threshold: config.preload_threshold,
        }
    }

    /// Requests left `pending` by a previous run go back to `requested`.
    pub async fn recover_pending(&self) -> Result<usize> {
        let moved = self.requests.reset_pending().await?;
        if moved > 0 {
            info!("Re-queued {} requests left pending by a previous run", moved);
        }
        Ok(moved)
    }

    /// Persist a listener request. A real request supersedes every suggestion.
    pub async fn submit(&self, track_id: &str, submitter: &str) -> Result<Request> {
        let request = self.requests.insert(track_id, submitter).await?;
        let dropped = {
            let mut tiers = self.tiers.lock();
            let dropped = tiers.suggestions.len();
            tiers.suggestions.clear();
            dropped
        };
        info!(
            "Request {} queued: {} from {} (cleared {} suggestions)",
            request.id, track_id, submitter, dropped
        );
        self.signals.wake_gatherer();
        Ok(request)
    }

    /// Append to the suggestion tier. Returns `false` once the tier is at its cap.
    pub fn suggest(&self, track_id: &str) -> bool {
        let mut tiers = self.tiers.lock();
        if tiers.suggestions.len() >= self.suggestion_cap {
            return false;
        }
        tiers.suggestions.push_back(QueueEntry::suggestion(track_id));
        info!("Added {} to suggestion queue", track_id);
        true
    }

    /// Next entry to prepare: the oldest `requested` entry (flipped to
    /// `pending`), else the head of the suggestion tier.
    ///
    /// The returned track counts as queued until `finish_download`.
    pub async fn dequeue_next(&self) -> Result<Option<QueueEntry>> {
        let _single_flight = self.dequeue.lock().await;

        let entry = match self.requests.claim_oldest().await? {
            Some(request) => Some(QueueEntry {
                track_id: request.track_id,
                submitter: Some(request.submitter),
                request: Some(request.id),
            }),
            None => self.tiers.lock().suggestions.pop_front(),
        };

        if let Some(entry) = &entry {
            self.tiers.lock().downloading = Some(entry.track_id.clone());
        }
        Ok(entry)
    }

    pub fn finish_download(&self) {
        self.tiers.lock().downloading = None;
    }

    pub fn downloading(&self) -> Option<String> {
        self.tiers.lock().downloading.clone()
    }

    pub fn buffer_add(&self, audio: PreparedAudio) {
        let depth = {
            let mut tiers = self.tiers.lock();
            tiers.buffer.push_back(audio);
            tiers.buffer.len()
        };
        info!("Audio buffer depth now {}", depth);
        self.signals.wake_player();
    }

    pub fn buffer_pop(&self) -> Option<PreparedAudio> {
        let (audio, needs_filling) = {
            let mut tiers = self.tiers.lock();
            let audio = tiers.buffer.pop_front();
            (audio, tiers.buffer.len() < self.preload_threshold)
        };
        if needs_filling {
            self.signals.wake_gatherer();
        }
        audio
    }

    /// Pop the buffer head and mark it as the track on air, atomically.
    pub fn pop_for_playback(&self) -> Option<PreparedAudio> {
        let (audio, needs_filling) = {
            let mut tiers = self.tiers.lock();
            let audio = tiers.buffer.pop_front();
            if let Some(audio) = &audio {
                tiers.playing = Some(audio.clone());
            }
            (audio, tiers.buffer.len() < self.preload_threshold)
        };
        if needs_filling {
            self.signals.wake_gatherer();
        }
        audio
    }

    pub fn finish_playback(&self) {
        self.tiers.lock().playing = None;
    }

    pub fn now_playing(&self) -> Option<PreparedAudio> {
        self.tiers.lock().playing.clone()
    }

    pub fn next_up(&self) -> Option<BufferedTrack> {
        self.tiers.lock().buffer.front().map(BufferedTrack::from)
    }

    /// The track an announcement should lead out of: the last buffered entry,
    /// else whatever is on air.
    pub fn previous_for_intro(&self) -> Option<BufferedTrack> {
        let tiers = self.tiers.lock();
        tiers
            .buffer
            .back()
            .or(tiers.playing.as_ref())
            .map(BufferedTrack::from)
    }

    pub fn buffer_len(&self) -> usize {
        self.tiers.lock().buffer.len()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.tiers.lock().buffer.is_empty()
    }

    pub fn buffer_needs_filling(&self) -> bool {
        self.buffer_len() < self.preload_threshold
    }

    pub async fn is_request_tier_full(&self) -> Result<bool> {
        Ok(self.requests.count(RequestStatus::Requested).await? >= self.request_cap)
    }

    /// Whether the track sits in any tier or is being downloaded or played.
    pub async fn is_track_already_queued(&self, track_id: &str) -> Result<bool> {
        let in_memory = {
            let tiers = self.tiers.lock();
            tiers.downloading.as_deref() == Some(track_id)
                || tiers.playing.as_ref().is_some_and(|a| a.track_id() == track_id)
                || tiers.buffer.iter().any(|a| a.track_id() == track_id)
                || tiers.suggestions.iter().any(|e| e.track_id == track_id)
        };
        if in_memory {
            return Ok(true);
        }
        self.requests.is_active(track_id).await
    }

    /// Outstanding requests plus prepared audio.
    pub async fn queue_depth(&self) -> Result<usize> {
        let requested = self.requests.count(RequestStatus::Requested).await?;
        Ok(requested + self.buffer_len())
    }

    pub async fn mark_failed(&self, request: RequestId) -> Result<bool> {
        let moved = self.requests.transition(request, RequestStatus::Failed, None).await?;
        if moved {
            warn!("Request {} marked failed", request);
        }
        Ok(moved)
    }

    pub async fn mark_played(&self, request: RequestId, history: HistoryId) -> Result<bool> {
        self.requests
            .transition(request, RequestStatus::Played, Some(history))
            .await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let requests = self.requests.list(RequestStatus::Requested).await?;
        let tiers = self.tiers.lock();
        Ok(QueueSnapshot {
            requests,
            suggestions: tiers.suggestions.iter().cloned().collect(),
            buffer: tiers.buffer.iter().map(BufferedTrack::from).collect(),
        })
    }

    /// Replace every active request. Later duplicates of a track are dropped.
    pub async fn replace_requests(&self, mut requests: Vec<NewRequest>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        requests.retain(|request| seen.insert(request.track_id.clone()));
        info!("Replacing request tier with {} entries", requests.len());
        self.requests.replace_active(requests).await?;
        self.signals.wake_gatherer();
        Ok(())
    }

    /// Replace the suggestion tier, dropping duplicates and anything past the cap.
    pub fn replace_suggestions(&self, track_ids: Vec<String>) -> usize {
        let mut tiers = self.tiers.lock();
        tiers.suggestions.clear();
        for track_id in track_ids {
            if tiers.suggestions.len() >= self.suggestion_cap {
                break;
            }
            if tiers.suggestions.iter().all(|e| e.track_id != track_id) {
                tiers.suggestions.push_back(QueueEntry::suggestion(track_id));
            }
        }
        info!("Suggestion tier replaced, {} entries", tiers.suggestions.len());
        tiers.suggestions.len()
    }

    /// Reorder the buffer to follow `track_ids`. Entries not named are removed
    /// and handed back so the caller can delete their files.
    pub fn reorder_buffer(&self, track_ids: &[String]) -> Vec<PreparedAudio> {
        let (removed, needs_filling) = {
            let mut tiers = self.tiers.lock();
            let mut remaining: Vec<PreparedAudio> = tiers.buffer.drain(..).collect();
            for track_id in track_ids {
                if let Some(index) = remaining.iter().position(|a| a.track_id() == track_id) {
                    let audio = remaining.remove(index);
                    tiers.buffer.push_back(audio);
                }
            }
            (remaining, tiers.buffer.len() < self.preload_threshold)
        };
        if needs_filling {
            self.signals.wake_gatherer();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRequestStore;
    use std::path::PathBuf;

    fn queue() -> QueueService {
        QueueService::new(
            Arc::new(MemoryRequestStore::new()),
            Arc::new(Signals::new()),
            &Config::default(),
        )
    }

    fn audio(id: &str) -> PreparedAudio {
        PreparedAudio {
            path: PathBuf::from(format!("{id}.mp3")),
            track: serde_json::from_value(serde_json::json!({"id": id, "title": id, "artist": "a"}))
                .unwrap(),
            submitter: None,
            request: None,
        }
    }

    #[tokio::test]
    async fn request_beats_suggestions_and_goes_pending() {
        let queue = queue();
        queue.suggest("S1");
        queue.submit("T1", "greg").await.unwrap();

        let entry = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(entry.track_id, "T1");
        assert_eq!(entry.submitter.as_deref(), Some("greg"));
        assert!(entry.request.is_some());

        // the suggestion was superseded by the request
        queue.finish_download();
        assert!(queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn suggestion_tier_is_capped_at_five() {
        let queue = queue();
        let accepted: Vec<bool> = (1..=6).map(|i| queue.suggest(&format!("S{i}"))).collect();
        assert_eq!(accepted, [true, true, true, true, true, false]);
        assert_eq!(queue.snapshot().await.unwrap().suggestions.len(), 5);
    }

    #[tokio::test]
    async fn suggestions_drain_fifo() {
        let queue = queue();
        queue.suggest("S1");
        queue.suggest("S2");
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().track_id, "S1");
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().track_id, "S2");
    }

    #[test]
    fn buffer_is_fifo() {
        let queue = queue();
        queue.buffer_add(audio("a"));
        queue.buffer_add(audio("b"));
        assert_eq!(queue.buffer_pop().unwrap().track_id(), "a");
        assert_eq!(queue.buffer_pop().unwrap().track_id(), "b");
        assert!(queue.buffer_pop().is_none());
    }

    #[tokio::test]
    async fn popping_below_threshold_wakes_gatherer() {
        let signals = Arc::new(Signals::new());
        let queue = QueueService::new(Arc::new(MemoryRequestStore::new()), signals.clone(), &Config::default());
        queue.buffer_add(audio("a"));
        queue.buffer_add(audio("b"));
        queue.buffer_add(audio("c"));

        queue.buffer_pop();
        let woke = tokio::time::timeout(std::time::Duration::from_millis(20), signals.gatherer_woken()).await;
        assert!(woke.is_err(), "two entries left is still at the threshold");

        queue.buffer_pop();
        signals.gatherer_woken().await;
    }

    #[tokio::test]
    async fn in_flight_track_counts_as_queued() {
        let queue = queue();
        queue.submit("T1", "greg").await.unwrap();
        queue.dequeue_next().await.unwrap();
        assert!(queue.is_track_already_queued("T1").await.unwrap());

        queue.buffer_add(audio("T1"));
        queue.finish_download();
        assert!(queue.is_track_already_queued("T1").await.unwrap());

        queue.pop_for_playback();
        assert!(queue.is_track_already_queued("T1").await.unwrap());
        queue.finish_playback();
        // the request stays pending until its play is recorded
        assert!(queue.is_track_already_queued("T1").await.unwrap());
        let request = queue.requests.list(RequestStatus::Pending).await.unwrap()[0].id;
        queue.mark_played(request, HistoryId::new()).await.unwrap();
        assert!(!queue.is_track_already_queued("T1").await.unwrap());
    }

    #[tokio::test]
    async fn request_tier_full_at_cap() {
        let config = Config {
            request_cap: 2,
            ..Config::default()
        };
        let queue = QueueService::new(Arc::new(MemoryRequestStore::new()), Arc::new(Signals::new()), &config);
        queue.submit("T1", "a").await.unwrap();
        assert!(!queue.is_request_tier_full().await.unwrap());
        queue.submit("T2", "b").await.unwrap();
        assert!(queue.is_request_tier_full().await.unwrap());
        assert_eq!(queue.queue_depth().await.unwrap(), 2);
    }

    #[test]
    fn replacing_suggestions_keeps_cap_and_uniqueness() {
        let queue = queue();
        let ids = ["a", "a", "b", "c", "d", "e", "f"].map(String::from).to_vec();
        assert_eq!(queue.replace_suggestions(ids), 5);
    }

    #[test]
    fn reorder_buffer_returns_dropped_entries() {
        let queue = queue();
        for id in ["a", "b", "c"] {
            queue.buffer_add(audio(id));
        }
        let removed = queue.reorder_buffer(&["c".to_string(), "a".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].track_id(), "b");
        assert_eq!(queue.buffer_pop().unwrap().track_id(), "c");
        assert_eq!(queue.buffer_pop().unwrap().track_id(), "a");
    }

    #[test]
    fn intro_leads_out_of_last_buffered_then_playing() {
        let queue = queue();
        assert!(queue.previous_for_intro().is_none());
        queue.buffer_add(audio("a"));
        queue.pop_for_playback();
        assert_eq!(queue.previous_for_intro().unwrap().track.id, "a");
        queue.buffer_add(audio("b"));
        assert_eq!(queue.previous_for_intro().unwrap().track.id, "b");
    }
}
