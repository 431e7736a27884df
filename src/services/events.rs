//! Coordination between the gatherer and player loops, and the public event
//! feed consumed by presentation code.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::models::Track;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Wake-ups for the two state machines.
///
/// `Notify` keeps at most one stored permit, so any number of triggers that
/// arrive while a loop is busy collapse into a single re-check.
#[derive(Default)]
pub struct Signals {
    gather: Notify,
    play: Notify,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer fell below its preload threshold, a download cycle ended, or a
    /// request arrived.
    pub fn wake_gatherer(&self) {
        self.gather.notify_one();
    }

    /// Audio was queued, a listener connected, or playback ended.
    pub fn wake_player(&self) {
        self.play.notify_one();
    }

    pub async fn gatherer_woken(&self) {
        self.gather.notified().await
    }

    pub async fn player_woken(&self) {
        self.play.notified().await
    }
}

/// At most one holder at a time; entering while held fails instead of waiting.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the flight when dropped, including on early return.
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NowPlaying {
    pub track: Track,
    pub submitter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerCounts {
    pub total: usize,
    pub authenticated: usize,
    pub anonymous: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StationEvent {
    TrackStarted(NowPlaying),
    TrackEnded { track_id: String, skipped: bool },
    TrackQueued { track_id: String, title: String, artist: String },
    ListenerCountChanged(ListenerCounts),
}

impl StationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StationEvent::TrackStarted(_) => "track-started",
            StationEvent::TrackEnded { .. } => "track-ended",
            StationEvent::TrackQueued { .. } => "track-queued",
            StationEvent::ListenerCountChanged(_) => "listener-count-changed",
        }
    }
}

/// Fan-out of `StationEvent`s. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: StationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
