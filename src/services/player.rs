//! The Player: pops prepared audio and broadcasts it to every listener at the
//! file's own bitrate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::audio::remove_quietly;
use super::events::{EventBus, NowPlaying, Signals, SingleFlight, StationEvent};
use super::listeners::ListenerRegistry;
use super::queue::QueueService;
use crate::config::Config;
use crate::models::PreparedAudio;
use crate::store::{HistoryRepository, TrackCache};
use crate::utils::mp3::probe_bitrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// No listeners or nothing buffered.
    NotReady,
    /// Another broadcast is in flight.
    Busy,
    Played {
        track_id: String,
        bytes_sent: u64,
        skipped: bool,
    },
}

pub struct Player {
    queue: Arc<QueueService>,
    listeners: Arc<ListenerRegistry>,
    tracks: Arc<dyn TrackCache>,
    history: Arc<dyn HistoryRepository>,
    signals: Arc<Signals>,
    events: EventBus,
    flight: SingleFlight,
    skip: Mutex<Option<oneshot::Sender<()>>>,
    chunk_size: usize,
    prelude_chunks: usize,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        queue: Arc<QueueService>,
        listeners: Arc<ListenerRegistry>,
        tracks: Arc<dyn TrackCache>,
        history: Arc<dyn HistoryRepository>,
        signals: Arc<Signals>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            listeners,
            tracks,
            history,
            signals,
            events,
            flight: SingleFlight::new(),
            skip: Mutex::new(None),
            chunk_size: config.chunk_size.max(1),
            prelude_chunks: config.prelude_chunks,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.flight.is_busy()
    }

    /// Cut the current broadcast short. Returns `false` when nothing is playing.
    pub fn skip(&self) -> bool {
        match self.skip.lock().take() {
            Some(tx) => {
                info!("Skipping current track");
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Idle -> Playing -> Idle for one buffered entry.
    pub async fn play_next(&self) -> PlayOutcome {
        if !self.listeners.has_listeners() || self.queue.buffer_is_empty() {
            return PlayOutcome::NotReady;
        }
        let Some(guard) = self.flight.try_enter() else {
            return PlayOutcome::Busy;
        };
        // skippable from the moment the track shows as on air
        let (skip_tx, skip_rx) = oneshot::channel();
        *self.skip.lock() = Some(skip_tx);
        let Some(audio) = self.queue.pop_for_playback() else {
            self.skip.lock().take();
            return PlayOutcome::NotReady;
        };

        info!("Now playing {}", audio.track.display_name());
        self.record_play(&audio).await;
        self.listeners.track_started(audio.track.clone());
        self.events.publish(StationEvent::TrackStarted(NowPlaying {
            track: audio.track.clone(),
            submitter: audio.submitter.clone(),
        }));

        let streamed = self.stream(&audio.path, skip_rx).await;
        self.skip.lock().take();

        let (bytes_sent, skipped) = match streamed {
            Ok(result) => result,
            Err(e) => {
                warn!("Broadcast of {} failed: {}", audio.path.display(), e);
                (0, false)
            }
        };

        remove_quietly(&audio.path).await;
        self.queue.finish_playback();
        self.listeners.track_ended();
        info!(
            "Finished {} ({} bytes{})",
            audio.track.display_name(),
            bytes_sent,
            if skipped { ", skipped" } else { "" }
        );
        self.events.publish(StationEvent::TrackEnded {
            track_id: audio.track.id.clone(),
            skipped,
        });

        drop(guard);
        self.signals.wake_player();
        self.signals.wake_gatherer();

        PlayOutcome::Played {
            track_id: audio.track.id,
            bytes_sent,
            skipped,
        }
    }

    /// Run until the task is dropped.
    pub async fn run(&self) {
        loop {
            let outcome = self.play_next().await;
            debug!("Player cycle: {:?}", outcome);
            self.signals.player_woken().await;
        }
    }

    async fn record_play(&self, audio: &PreparedAudio) {
        if let Err(e) = self.tracks.increment_play_count(audio.track_id()).await {
            warn!("Could not bump play count for {}: {}", audio.track_id(), e);
        }

        let history = match self.history.record_play(&audio.track, audio.submitter.as_deref()).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Could not record play of {}: {}", audio.track_id(), e);
                return;
            }
        };

        if let Some(request) = audio.request {
            match self.queue.mark_played(request, history).await {
                Ok(true) => debug!("Request {} played", request),
                Ok(false) => warn!("Request {} was not pending", request),
                Err(e) => warn!("Could not mark request {} played: {}", request, e),
            }
        }
    }

    /// Throttled fan-out of one file. The first `prelude_chunks` go out at once
    /// so clients can start decoding; the rest follow one per chunk duration.
    async fn stream(&self, path: &Path, mut skip: oneshot::Receiver<()>) -> std::io::Result<(u64, bool)> {
        let bitrate = probe_bitrate(path).await;
        let chunk_duration = Duration::from_secs_f64(self.chunk_size as f64 * 8.0 / bitrate as f64);
        debug!(
            "Streaming {} at {}kbps, chunk every {:?}",
            path.display(),
            bitrate / 1000,
            chunk_duration
        );

        let mut file = File::open(path).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut interval = interval_at(Instant::now() + chunk_duration, chunk_duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent = 0u64;
        let mut chunks = 0usize;
        loop {
            let read = read_chunk(&mut file, &mut buffer).await?;
            if read == 0 {
                return Ok((sent, false));
            }

            if chunks >= self.prelude_chunks {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut skip => return Ok((sent, true)),
                }
            }

            self.listeners.broadcast(Bytes::copy_from_slice(&buffer[..read]));
            sent += read as u64;
            chunks += 1;
        }
    }
}

/// Fill `buffer` unless the file ends first.
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
