//! The Gatherer: turns the next queue entry into announced, joined audio in
//! the buffer tier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::announcer::{Announcer, Introduction};
use super::audio::{remove_partials, remove_quietly, AudioJoiner};
use super::downloader::Downloader;
use super::events::{EventBus, Signals, SingleFlight, StationEvent};
use super::proxy::ProxyRotation;
use super::queue::QueueService;
use super::retry::{AttemptError, RetryError, RetryPolicy};
use super::suggestions::Suggester;
use crate::config::Config;
use crate::error::{AppError, FatalError, GatherError, TrackError};
use crate::models::{PreparedAudio, QueueEntry, Track};
use crate::store::{TrackCache, TrackCatalog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatherOutcome {
    /// Buffer already at its preload depth.
    NotNeeded,
    /// Another cycle is downloading.
    Busy,
    /// Nothing to fetch, even after repopulating suggestions.
    Starved,
    Queued { track_id: String },
    Skipped { track_id: String },
}

/// Announcement audio for one track.
enum Intro {
    /// Shared clip, never deleted.
    Placeholder(PathBuf),
    Spoken(PathBuf),
}

impl Intro {
    fn path(&self) -> &PathBuf {
        match self {
            Intro::Placeholder(path) | Intro::Spoken(path) => path,
        }
    }
}

/// Everything the gatherer calls out to.
pub struct GathererDeps {
    pub catalog: Arc<dyn TrackCatalog>,
    pub tracks: Arc<dyn TrackCache>,
    pub proxies: Arc<ProxyRotation>,
    pub downloader: Arc<dyn Downloader>,
    pub announcer: Option<Arc<dyn Announcer>>,
    pub joiner: Arc<dyn AudioJoiner>,
    pub suggester: Suggester,
}

pub struct Gatherer {
    queue: Arc<QueueService>,
    deps: GathererDeps,
    signals: Arc<Signals>,
    events: EventBus,
    flight: SingleFlight,
    retry: RetryPolicy,
    work_dir: PathBuf,
    placeholder_clip: PathBuf,
    network_timeout: Duration,
    starved_retry: Duration,
}

impl Gatherer {
    pub fn new(
        config: &Config,
        queue: Arc<QueueService>,
        deps: GathererDeps,
        signals: Arc<Signals>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            deps,
            signals,
            events,
            flight: SingleFlight::new(),
            retry: RetryPolicy::from_config(config),
            work_dir: config.work_dir.clone(),
            placeholder_clip: config.placeholder_clip.clone(),
            network_timeout: config.network_timeout(),
            starved_retry: config.starved_retry(),
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.flight.is_busy()
    }

    /// Idle -> Downloading -> Idle for one queue entry. Only a fatal error
    /// escapes; per-track failures mark the request failed and skip the track.
    pub async fn gather(&self) -> Result<GatherOutcome, FatalError> {
        let Some(guard) = self.flight.try_enter() else {
            return Ok(GatherOutcome::Busy);
        };
        if !self.queue.buffer_needs_filling() {
            return Ok(GatherOutcome::NotNeeded);
        }

        let entry = match self.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                info!("Nothing to gather, queues are empty");
                return Ok(GatherOutcome::Starved);
            }
            Err(e) => {
                warn!("Could not read the queue: {}", e);
                return Ok(GatherOutcome::Starved);
            }
        };

        info!(
            "Downloading {} ({})",
            entry.track_id,
            entry.submitter.as_deref().unwrap_or("suggestion")
        );

        let outcome = match self.prepare(&entry).await {
            Ok(audio) => {
                self.events.publish(StationEvent::TrackQueued {
                    track_id: audio.track.id.clone(),
                    title: audio.track.title.clone(),
                    artist: audio.track.artist.clone(),
                });
                info!("Queued {}", audio.track.display_name());
                self.queue.buffer_add(audio);
                GatherOutcome::Queued {
                    track_id: entry.track_id.clone(),
                }
            }
            Err(GatherError::Track(e)) => {
                warn!("Skipping {}: {}", entry.track_id, e);
                if let Some(request) = entry.request {
                    if let Err(e) = self.queue.mark_failed(request).await {
                        warn!("Could not mark request {} failed: {}", request, e);
                    }
                }
                GatherOutcome::Skipped {
                    track_id: entry.track_id.clone(),
                }
            }
            Err(GatherError::Fatal(e)) => {
                self.queue.finish_download();
                error!("Gatherer cannot continue: {}", e);
                return Err(e);
            }
        };

        self.queue.finish_download();
        drop(guard);
        // re-arm: the buffer may still be short
        self.signals.wake_gatherer();
        Ok(outcome)
    }

    /// Run until a fatal error.
    pub async fn run(&self) -> Result<(), FatalError> {
        loop {
            let outcome = self.gather().await?;
            debug!("Gatherer cycle: {:?}", outcome);
            if outcome == GatherOutcome::Starved {
                tokio::select! {
                    _ = self.signals.gatherer_woken() => {}
                    _ = tokio::time::sleep(self.starved_retry) => {}
                }
            } else {
                self.signals.gatherer_woken().await;
            }
        }
    }

    async fn next_entry(&self) -> crate::error::Result<Option<QueueEntry>> {
        if let Some(entry) = self.queue.dequeue_next().await? {
            return Ok(Some(entry));
        }
        info!("Queues empty, repopulating suggestions");
        if let Err(e) = self.deps.suggester.populate(&self.queue).await {
            warn!("Suggestion repopulation failed: {}", e);
        }
        self.queue.dequeue_next().await
    }

    async fn prepare(&self, entry: &QueueEntry) -> Result<PreparedAudio, GatherError> {
        let track = self.resolve(&entry.track_id).await?;
        let url = track
            .source_url()
            .ok_or_else(|| TrackError::NoSourceUrl(track.id.clone()))?
            .to_string();

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(TrackError::from)?;
        let stem = format!("{}-{}", file_safe(&track.id), Uuid::new_v4().simple());

        let song = self.download(&url, &stem).await?;
        let intro = match self.announce(&track, entry.submitter.as_deref(), &stem).await {
            Ok(intro) => intro,
            Err(e) => {
                remove_quietly(&song).await;
                return Err(e.into());
            }
        };

        let combined = self.work_dir.join(format!("combined-{stem}.mp3"));
        let joined = self.deps.joiner.join(intro.path(), &song, &combined).await;

        remove_quietly(&song).await;
        if let Intro::Spoken(path) = &intro {
            remove_quietly(path).await;
        }
        if let Err(e) = joined {
            remove_quietly(&combined).await;
            return Err(TrackError::Join(e.to_string()).into());
        }

        Ok(PreparedAudio {
            path: combined,
            track,
            submitter: entry.submitter.clone(),
            request: entry.request,
        })
    }

    /// Cached metadata, else a bounded catalog lookup that fills the cache.
    async fn resolve(&self, track_id: &str) -> Result<Track, TrackError> {
        if let Some(track) = self.deps.tracks.get(track_id).await? {
            return Ok(track);
        }

        let fetched = tokio::time::timeout(self.network_timeout, self.deps.catalog.resolve(track_id))
            .await
            .map_err(|_| AppError::Catalog(format!("lookup of {track_id} timed out")))??;
        let track = fetched.ok_or_else(|| TrackError::UnknownTrack(track_id.to_string()))?;
        self.deps.tracks.put(&track).await?;
        Ok(track)
    }

    async fn download(&self, url: &str, stem: &str) -> Result<PathBuf, GatherError> {
        let output = self.work_dir.join(format!("{stem}.mp3"));
        let proxies = &self.deps.proxies;
        let downloader = &self.deps.downloader;
        let work_dir = &self.work_dir;
        let retry = self.retry;

        let result = retry
            .run(
                |attempt| {
                    let output = output.clone();
                    async move {
                        // health checks stay outside the timeout so pool exhaustion surfaces
                        let proxy = proxies.acquire().await?;
                        match &proxy {
                            Some(proxy) => debug!("Download attempt {} via {}", attempt, proxy),
                            None => debug!("Download attempt {} direct", attempt),
                        }
                        retry
                            .bounded(async {
                                downloader
                                    .fetch(url, proxy.as_ref(), &output)
                                    .await
                                    .map_err(|e| AttemptError::Retryable(e.to_string()))
                            })
                            .await
                    }
                },
                |_| async move {
                    proxies.mark_active_bad().await;
                    remove_partials(work_dir, stem).await;
                },
            )
            .await;

        match result {
            Ok(path) => Ok(path),
            Err(RetryError::Exhausted { attempts, last_error }) => {
                remove_partials(work_dir, stem).await;
                Err(TrackError::DownloadExhausted { attempts, last_error }.into())
            }
            Err(RetryError::Fatal(fatal)) => {
                remove_partials(work_dir, stem).await;
                Err(fatal.into())
            }
        }
    }

    /// Spoken introduction, or the shared placeholder when no announcer is
    /// configured. A configured announcer that fails skips the track.
    async fn announce(&self, track: &Track, submitter: Option<&str>, stem: &str) -> Result<Intro, TrackError> {
        let Some(announcer) = &self.deps.announcer else {
            return match tokio::fs::try_exists(&self.placeholder_clip).await {
                Ok(true) => Ok(Intro::Placeholder(self.placeholder_clip.clone())),
                _ => Err(TrackError::Announcement(format!(
                    "placeholder clip {} is missing",
                    self.placeholder_clip.display()
                ))),
            };
        };

        let previous = self.queue.previous_for_intro();
        let current = Introduction::new(track, submitter);
        let previous = previous
            .as_ref()
            .map(|p| Introduction::new(&p.track, p.submitter.as_deref()));
        let output = self.work_dir.join(format!("intro-{stem}.mp3"));

        let spoken = tokio::time::timeout(self.retry.attempt_timeout, async {
            let text = announcer.introduce(current, previous).await?;
            announcer.speak(&text, &output).await
        })
        .await;

        match spoken {
            Ok(Ok(path)) => Ok(Intro::Spoken(path)),
            Ok(Err(e)) => {
                remove_quietly(&output).await;
                Err(TrackError::Announcement(e.to_string()))
            }
            Err(_) => {
                remove_quietly(&output).await;
                Err(TrackError::Announcement("text-to-speech timed out".into()))
            }
        }
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
