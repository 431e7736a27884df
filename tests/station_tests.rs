// Integration tests for the broadcast pipeline
// These drive a full Station with in-memory stores and fake collaborators

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;

use airwave::error::FatalError;
use airwave::models::{Identity, RequestStatus};
use airwave::radio::SubmitOutcome;
use airwave::services::events::StationEvent;
use airwave::services::proxy::{ProxyEndpoint, ProxyProber, ProxyRotation};
use airwave::store::{HistoryRepository, RequestRepository};

use common::*;

fn greg() -> Identity {
    Identity::Authenticated("greg".into())
}

struct RejectAll;

#[async_trait]
impl ProxyProber for RejectAll {
    async fn is_healthy(&self, _proxy: &ProxyEndpoint) -> bool {
        false
    }
}

#[tokio::test]
async fn submitted_request_is_gathered_into_the_buffer() {
    let t = station(4096).await;
    let outcome = t.station.submit(&track_id(1), "greg").await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued { position: 1 }));

    let _pipeline = t.station.start().await.unwrap();
    let station = t.station.clone();
    assert!(
        eventually(|| {
            let station = station.clone();
            async move { !station.queue_snapshot().await.unwrap().buffer.is_empty() }
        })
        .await
    );

    let buffer = t.station.queue_snapshot().await.unwrap().buffer;
    assert_eq!(buffer[0].track.id, track_id(1));
    assert_eq!(buffer[0].submitter.as_deref(), Some("greg"));

    // buffered but not yet played
    let pending = t.requests.list(RequestStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].track_id, track_id(1));
    assert!(t.requests.list(RequestStatus::Requested).await.unwrap().is_empty());

    // the shared intro clip is never consumed by a join
    assert!(t.dir.path().join("intro.mp3").exists());
}

#[tokio::test]
async fn exhausted_download_fails_the_request() {
    let downloader = Arc::new(FailingDownloader {
        calls: AtomicUsize::new(0),
    });
    let t = station_with(|_| {}, downloader.clone(), ProxyRotation::disabled()).await;
    t.station.submit(&track_id(2), "greg").await.unwrap();
    let _pipeline = t.station.start().await.unwrap();

    let requests = t.requests.clone();
    assert!(
        eventually(|| {
            let requests = requests.clone();
            async move { !requests.list(RequestStatus::Failed).await.unwrap().is_empty() }
        })
        .await
    );

    let failed = t.requests.list(RequestStatus::Failed).await.unwrap();
    assert_eq!(failed[0].track_id, track_id(2));
    assert!(downloader.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn proxy_pool_exhaustion_stops_the_pipeline() {
    let proxies = ProxyRotation::new(
        None,
        Arc::new(RejectAll),
        vec![ProxyEndpoint {
            host: "10.0.0.1".into(),
            port: 8080,
        }],
    );
    let t = station_with(|_| {}, Arc::new(FakeDownloader::new(1024)), proxies).await;
    t.station.submit(&track_id(1), "greg").await.unwrap();

    let pipeline = t.station.start().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), pipeline)
        .await
        .expect("pipeline should stop")
        .unwrap();
    assert_eq!(result, Err(FatalError::ProxyPoolExhausted));
}

/// Takes longer than a download attempt is allowed, then fails anyway.
struct SlowRejection;

#[async_trait]
impl ProxyProber for SlowRejection {
    async fn is_healthy(&self, _proxy: &ProxyEndpoint) -> bool {
        tokio::time::sleep(Duration::from_secs(2)).await;
        false
    }
}

#[tokio::test]
async fn slow_health_checks_still_exhaust_the_pool() {
    let proxies = ProxyRotation::new(
        None,
        Arc::new(SlowRejection),
        vec![ProxyEndpoint {
            host: "10.0.0.1".into(),
            port: 8080,
        }],
    );
    let downloader = Arc::new(FakeDownloader::new(1024));
    let t = station_with(|config| config.attempt_timeout_secs = 1, downloader.clone(), proxies).await;
    t.station.submit(&track_id(1), "greg").await.unwrap();

    let pipeline = t.station.start().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), pipeline)
        .await
        .expect("pipeline should stop")
        .unwrap();
    assert_eq!(result, Err(FatalError::ProxyPoolExhausted));
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn station_starts_only_once() {
    let t = station(1024).await;
    let _pipeline = t.station.start().await.unwrap();
    assert!(t.station.start().await.is_err());
}

#[tokio::test]
async fn submission_rejections() {
    let t = station_with(
        |config| config.rate_limit_requests = 2,
        Arc::new(FakeDownloader::new(1024)),
        ProxyRotation::disabled(),
    )
    .await;
    let station = &t.station;

    assert!(matches!(station.submit("   ", "greg").await.unwrap(), SubmitOutcome::InvalidQuery));
    assert!(matches!(
        station.submit(&track_id(99), "greg").await.unwrap(),
        SubmitOutcome::NotFound
    ));

    match station.submit("moon", "greg").await.unwrap() {
        SubmitOutcome::SearchResults { tracks } => assert_eq!(tracks.len(), 2),
        other => panic!("unexpected {other:?}"),
    }

    t.history.record_play(&track(3, "Blue in Green"), None).await.unwrap();
    assert!(matches!(
        station.submit(&track_id(3), "greg").await.unwrap(),
        SubmitOutcome::PlayedTooRecently
    ));

    assert!(matches!(
        station.submit(&track_id(1), "greg").await.unwrap(),
        SubmitOutcome::Queued { position: 1 }
    ));
    assert!(matches!(
        station.submit(&track_id(1), "bob").await.unwrap(),
        SubmitOutcome::AlreadyQueued
    ));
    assert!(matches!(
        station.submit(&track_id(2), "greg").await.unwrap(),
        SubmitOutcome::Queued { position: 2 }
    ));
    assert!(matches!(
        station.submit(&track_id(4), "greg").await.unwrap(),
        SubmitOutcome::RateLimited
    ));
}

#[tokio::test]
async fn full_request_tier_is_rejected() {
    let t = station_with(
        |config| config.request_cap = 1,
        Arc::new(FakeDownloader::new(1024)),
        ProxyRotation::disabled(),
    )
    .await;

    assert!(t.station.submit(&track_id(1), "greg").await.unwrap().is_accepted());
    assert!(matches!(
        t.station.submit(&track_id(2), "bob").await.unwrap(),
        SubmitOutcome::QueueFull
    ));
}

#[tokio::test]
async fn listeners_receive_identical_bytes() {
    let t = station(8 * 1024).await;
    let (_, first) = t.station.connect(greg());
    let (_, second) = t.station.connect(Identity::anonymous());
    assert_eq!(t.station.listener_counts().total, 2);

    t.station.submit(&track_id(1), "greg").await.unwrap();
    let _pipeline = t.station.start().await.unwrap();

    let wanted = INTRO_BYTES + 8 * 1024;
    let (a, b) = tokio::join!(collect(first, wanted), collect(second, wanted));
    assert_eq!(a.len(), wanted);
    assert_eq!(a, b);
    assert!(a[..INTRO_BYTES].iter().all(|byte| *byte == 0xAA));
}

async fn collect(stream: impl tokio_stream::Stream<Item = std::io::Result<bytes::Bytes>>, wanted: usize) -> Vec<u8> {
    let mut stream = Box::pin(stream);
    let mut received = Vec::new();
    while received.len() < wanted {
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(Ok(chunk))) => received.extend_from_slice(&chunk),
            _ => break,
        }
    }
    received.truncate(wanted);
    received
}

#[tokio::test]
async fn skip_ends_the_current_track() {
    let t = station(256 * 1024).await;
    let mut events = t.station.subscribe();
    let (_, _stream) = t.station.connect(greg());
    t.station.submit(&track_id(1), "greg").await.unwrap();
    let _pipeline = t.station.start().await.unwrap();

    let station = t.station.clone();
    assert!(
        eventually(|| {
            let station = station.clone();
            async move { station.now_playing().is_some() }
        })
        .await
    );
    assert_eq!(t.station.now_playing().unwrap().track.id, track_id(1));
    assert!(t.station.skip());

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(StationEvent::TrackEnded { track_id, skipped }) = events.recv().await {
                return (track_id, skipped);
            }
        }
    })
    .await
    .expect("track should end");
    assert_eq!(ended, (track_id(1), true));

    let played = t.requests.list(RequestStatus::Played).await.unwrap();
    assert_eq!(played[0].track_id, track_id(1));
}

#[tokio::test]
async fn tune_out_closes_every_connection_of_a_handle() {
    let t = station(1024).await;
    let (_, first) = t.station.connect(greg());
    let (_, second) = t.station.connect(greg());
    let (_, _other) = t.station.connect(Identity::Authenticated("bob".into()));

    assert_eq!(t.station.tune_out(&greg()), 2);
    assert_eq!(t.station.listener_counts().total, 1);

    let mut first = Box::pin(first);
    let mut second = Box::pin(second);
    assert!(first.next().await.is_none());
    assert!(second.next().await.is_none());
}

#[tokio::test]
async fn dropping_a_stream_disconnects_the_listener() {
    let t = station(1024).await;
    let (_, stream) = t.station.connect(greg());
    assert_eq!(t.station.listener_report().handles, vec!["greg".to_string()]);

    drop(stream);
    assert_eq!(t.station.listener_counts().total, 0);
}
