//! Registry of open listener connections and broadcast fan-out.
//!
//! Each connection owns a bounded write queue. The player pushes chunks with
//! `try_send`, so one stalled client can never hold up the shared throttle: a
//! full queue evicts that listener and a closed queue removes it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, ListenerCounts, Signals, StationEvent};
use crate::config::Config;
use crate::error::Result;
use crate::models::{Identity, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receives a play once a listener has stayed tuned for the dwell time.
/// Failures are logged and never reach the broadcast.
#[async_trait]
pub trait PlayConfirmation: Send + Sync {
    async fn confirm_play(&self, identity: &Identity, track: &Track) -> Result<()>;
}

pub struct NoopConfirmation;

#[async_trait]
impl PlayConfirmation for NoopConfirmation {
    async fn confirm_play(&self, identity: &Identity, track: &Track) -> Result<()> {
        debug!("{} heard {}", identity, track.display_name());
        Ok(())
    }
}

struct Listener {
    identity: Identity,
    tx: mpsc::Sender<Bytes>,
    connected_at: DateTime<Utc>,
    bytes_sent: u64,
    last_seen_track: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub id: ListenerId,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub last_seen_track: Option<String>,
}

pub struct ListenerRegistry {
    listeners: DashMap<ListenerId, Listener>,
    /// One dwell timer per identity, so several tabs confirm a play once.
    dwell_timers: DashMap<Identity, JoinHandle<()>>,
    now_playing: ArcSwapOption<Track>,
    confirmations: Arc<dyn PlayConfirmation>,
    signals: Arc<Signals>,
    events: EventBus,
    dwell: Duration,
    queue_chunks: usize,
}

impl ListenerRegistry {
    pub fn new(
        config: &Config,
        signals: Arc<Signals>,
        events: EventBus,
        confirmations: Arc<dyn PlayConfirmation>,
    ) -> Self {
        Self {
            listeners: DashMap::new(),
            dwell_timers: DashMap::new(),
            now_playing: ArcSwapOption::empty(),
            confirmations,
            signals,
            events,
            dwell: config.dwell(),
            queue_chunks: config.listener_queue_chunks.max(1),
        }
    }

    /// Attach a connection. Bytes broadcast from now on arrive on the returned
    /// receiver; a listener joining mid-track hears it from the current position.
    pub fn register(&self, identity: Identity) -> (ListenerId, mpsc::Receiver<Bytes>) {
        let id = ListenerId::new();
        let (tx, rx) = mpsc::channel(self.queue_chunks);
        let last_seen_track = self.now_playing.load_full().map(|track| track.id.clone());

        self.listeners.insert(
            id,
            Listener {
                identity: identity.clone(),
                tx,
                connected_at: Utc::now(),
                bytes_sent: 0,
                last_seen_track,
            },
        );
        self.arm_dwell(&identity);

        info!("Listener {} ({}) connected. Total: {}", id, identity, self.active_count());
        self.publish_counts();
        self.signals.wake_player();
        (id, rx)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let Some((_, listener)) = self.listeners.remove(&id) else {
            return false;
        };
        if !self.has_identity(&listener.identity) {
            self.cancel_dwell(&listener.identity);
        }
        info!(
            "Listener {} ({}) removed after {} bytes. Total: {}",
            id,
            listener.identity,
            listener.bytes_sent,
            self.active_count()
        );
        self.publish_counts();
        true
    }

    /// Drop every connection held by `identity`.
    pub fn tune_out(&self, identity: &Identity) -> usize {
        let ids: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|entry| &entry.identity == identity)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter(|id| self.unregister(*id)).count()
    }

    /// Move every connection of `old` to `new`, keeping the connections open.
    /// Dwell bookkeeping restarts under the new identity.
    pub fn change_identity(&self, old: &Identity, new: Identity) -> usize {
        let mut moved = 0;
        for mut entry in self.listeners.iter_mut() {
            if &entry.identity == old {
                entry.identity = new.clone();
                moved += 1;
            }
        }
        if moved > 0 {
            self.cancel_dwell(old);
            self.arm_dwell(&new);
            info!("Moved {} connections from {} to {}", moved, old, new);
            self.publish_counts();
        }
        moved
    }

    /// Queue `chunk` on every connection. Listeners whose queue is full or
    /// closed are removed after the pass. Returns how many accepted it.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for mut entry in self.listeners.iter_mut() {
            match entry.tx.try_send(chunk.clone()) {
                Ok(()) => {
                    entry.bytes_sent += chunk.len() as u64;
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Listener {} is not keeping up, disconnecting", entry.key());
                    dead.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Listener {} went away", entry.key());
                    dead.push(*entry.key());
                }
            }
        }

        for id in dead {
            self.unregister(id);
        }
        delivered
    }

    /// Reset every dwell timer against the track that just went on air.
    pub fn track_started(&self, track: Track) {
        let track = Arc::new(track);
        self.now_playing.store(Some(track.clone()));

        let mut identities = Vec::new();
        for mut entry in self.listeners.iter_mut() {
            entry.last_seen_track = Some(track.id.clone());
            if !identities.contains(&entry.identity) {
                identities.push(entry.identity.clone());
            }
        }
        for identity in &identities {
            self.arm_dwell(identity);
        }
    }

    pub fn track_ended(&self) {
        self.now_playing.store(None);
        let identities: Vec<Identity> = self.dwell_timers.iter().map(|entry| entry.key().clone()).collect();
        for identity in &identities {
            self.cancel_dwell(identity);
        }
    }

    pub fn now_playing(&self) -> Option<Arc<Track>> {
        self.now_playing.load_full()
    }

    pub fn active_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn counts(&self) -> ListenerCounts {
        let anonymous = self.listeners.iter().filter(|entry| entry.identity.is_anonymous()).count();
        let total = self.listeners.len();
        ListenerCounts {
            total,
            authenticated: total.saturating_sub(anonymous),
            anonymous,
        }
    }

    /// Distinct authenticated handles currently tuned in.
    pub fn authenticated_handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| !entry.identity.is_anonymous())
            .map(|entry| entry.identity.handle().to_string())
            .collect();
        handles.sort();
        handles.dedup();
        handles
    }

    pub fn list(&self) -> Vec<ListenerInfo> {
        self.listeners
            .iter()
            .map(|entry| ListenerInfo {
                id: *entry.key(),
                identity: entry.identity.clone(),
                connected_at: entry.connected_at,
                bytes_sent: entry.bytes_sent,
                last_seen_track: entry.last_seen_track.clone(),
            })
            .collect()
    }

    fn has_identity(&self, identity: &Identity) -> bool {
        self.listeners.iter().any(|entry| &entry.identity == identity)
    }

    fn arm_dwell(&self, identity: &Identity) {
        let Some(track) = self.now_playing.load_full() else {
            self.cancel_dwell(identity);
            return;
        };

        let confirmations = self.confirmations.clone();
        let who = identity.clone();
        let dwell = self.dwell;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            if let Err(e) = confirmations.confirm_play(&who, &track).await {
                warn!("Play confirmation for {} failed: {}", who, e);
            }
        });

        if let Some(previous) = self.dwell_timers.insert(identity.clone(), timer) {
            previous.abort();
        }
    }

    fn cancel_dwell(&self, identity: &Identity) {
        if let Some((_, timer)) = self.dwell_timers.remove(identity) {
            timer.abort();
        }
    }

    fn publish_counts(&self) {
        self.events.publish(StationEvent::ListenerCountChanged(self.counts()));
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        for entry in self.dwell_timers.iter() {
            entry.value().abort();
        }
    }
}
