//! Outbound proxy rotation for the downloader.
//!
//! The pool is mutated only here. With no list source and no seeded pool the
//! service is a passthrough and `acquire` hands out `None`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, FatalError, Result};

const PROBE_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyEndpoint {
    type Err = AppError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let address = line.strip_prefix("http://").unwrap_or(line);
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| AppError::BadRequest(format!("proxy '{line}' is missing a port")))?;
        let port = port
            .parse()
            .map_err(|_| AppError::BadRequest(format!("proxy '{line}' has an invalid port")))?;
        if host.is_empty() {
            return Err(AppError::BadRequest(format!("proxy '{line}' is missing a host")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Parse a proxy list body, one endpoint per line. Malformed lines are skipped.
pub fn parse_proxy_list(body: &str) -> Vec<ProxyEndpoint> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse() {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                debug!("Skipping proxy list entry: {}", e);
                None
            }
        })
        .collect()
}

/// Where fresh pool contents come from.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>>;
}

/// Health check run before a proxy is handed out.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn is_healthy(&self, proxy: &ProxyEndpoint) -> bool;
}

pub struct HttpProxyList {
    client: reqwest::Client,
    url: String,
}

impl HttpProxyList {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Storage(format!("proxy list client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ProxySource for HttpProxyList {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AppError::Storage(format!("proxy list fetch failed: {e}")))?
            .text()
            .await
            .map_err(|e| AppError::Storage(format!("proxy list body unreadable: {e}")))?;
        Ok(parse_proxy_list(&body))
    }
}

/// Times repeated fetches of `probe_url` through the candidate proxy and
/// accepts it when the mean throughput beats `min_mbps`.
pub struct HttpProber {
    probe_url: String,
    min_mbps: f64,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(probe_url: impl Into<String>, min_mbps: f64, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            min_mbps,
            timeout,
        }
    }

    async fn measure_mbps(&self, client: &reqwest::Client) -> f64 {
        let started = Instant::now();
        let body = match client.get(&self.probe_url).send().await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        match body {
            Ok(bytes) => {
                let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
                (bytes.len() as f64 * 8.0 / 1_000_000.0) / secs
            }
            Err(e) => {
                debug!("Proxy probe request failed: {}", e);
                0.0
            }
        }
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn is_healthy(&self, proxy: &ProxyEndpoint) -> bool {
        let client = match reqwest::Proxy::all(proxy.url())
            .and_then(|p| reqwest::Client::builder().proxy(p).timeout(self.timeout).build())
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot build client for proxy {}: {}", proxy, e);
                return false;
            }
        };

        let mut total = 0.0;
        for _ in 0..PROBE_ROUNDS {
            total += self.measure_mbps(&client).await;
        }
        let mean = total / PROBE_ROUNDS as f64;
        debug!("Proxy {} averaged {:.2} Mbps", proxy, mean);
        mean > self.min_mbps
    }
}

/// Prober used when no probe url is configured.
pub struct AssumeHealthy;

#[async_trait]
impl ProxyProber for AssumeHealthy {
    async fn is_healthy(&self, _proxy: &ProxyEndpoint) -> bool {
        true
    }
}

#[derive(Default)]
struct PoolState {
    pool: Vec<ProxyEndpoint>,
    active: Option<ProxyEndpoint>,
}

pub struct ProxyRotation {
    source: Option<Arc<dyn ProxySource>>,
    prober: Arc<dyn ProxyProber>,
    state: Mutex<PoolState>,
    enabled: bool,
}

impl ProxyRotation {
    pub fn new(
        source: Option<Arc<dyn ProxySource>>,
        prober: Arc<dyn ProxyProber>,
        initial_pool: Vec<ProxyEndpoint>,
    ) -> Self {
        let enabled = source.is_some() || !initial_pool.is_empty();
        Self {
            source,
            prober,
            state: Mutex::new(PoolState {
                pool: initial_pool,
                active: None,
            }),
            enabled,
        }
    }

    /// No pool, no source: every download goes out directly.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(AssumeHealthy), Vec::new())
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(list_url) = &config.proxy_list_url else {
            info!("No proxy list configured, downloads go out directly");
            return Ok(Self::disabled());
        };

        let source: Arc<dyn ProxySource> =
            Arc::new(HttpProxyList::new(list_url.clone(), config.network_timeout())?);
        let prober: Arc<dyn ProxyProber> = match &config.proxy_probe_url {
            Some(url) => Arc::new(HttpProber::new(
                url.clone(),
                config.proxy_min_mbps,
                config.network_timeout(),
            )),
            None => Arc::new(AssumeHealthy),
        };
        Ok(Self::new(Some(source), prober, Vec::new()))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn pool_size(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    pub async fn active(&self) -> Option<ProxyEndpoint> {
        self.state.lock().await.active.clone()
    }

    pub async fn refresh_pool(&self) {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await;
    }

    async fn refresh_locked(&self, state: &mut PoolState) {
        let Some(source) = &self.source else {
            debug!("No proxy list source, pool left as is");
            return;
        };
        match source.fetch().await {
            Ok(pool) => {
                info!("Proxy pool refreshed with {} endpoints", pool.len());
                state.pool = pool;
            }
            Err(e) => warn!("Failed to refresh proxy list: {}", e),
        }
    }

    /// A working proxy, `None` in passthrough mode. Exhausting the pool twice
    /// (before and after a refresh) is fatal.
    pub async fn acquire(&self) -> std::result::Result<Option<ProxyEndpoint>, FatalError> {
        if !self.enabled {
            return Ok(None);
        }

        let mut state = self.state.lock().await;

        if let Some(active) = state.active.clone() {
            if self.prober.is_healthy(&active).await {
                return Ok(Some(active));
            }
            warn!("Active proxy {} failed its health check", active);
            state.pool.retain(|proxy| proxy != &active);
            state.active = None;
        }

        if let Some(proxy) = self.probe_pool(&mut state).await {
            return Ok(Some(proxy));
        }

        warn!("Proxy pool exhausted, refreshing");
        self.refresh_locked(&mut state).await;

        if let Some(proxy) = self.probe_pool(&mut state).await {
            return Ok(Some(proxy));
        }

        error!("No working proxies found after refresh");
        Err(FatalError::ProxyPoolExhausted)
    }

    async fn probe_pool(&self, state: &mut PoolState) -> Option<ProxyEndpoint> {
        while !state.pool.is_empty() {
            let index = rand::thread_rng().gen_range(0..state.pool.len());
            let candidate = state.pool[index].clone();
            if self.prober.is_healthy(&candidate).await {
                info!("Using proxy {}", candidate);
                state.active = Some(candidate.clone());
                return Some(candidate);
            }
            debug!("Dropping unhealthy proxy {}", candidate);
            state.pool.swap_remove(index);
        }
        None
    }

    pub async fn mark_active_bad(&self) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.take() {
            warn!("Marking proxy {} bad", active);
            state.pool.retain(|proxy| proxy != &active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RejectHosts(HashSet<String>);

    #[async_trait]
    impl ProxyProber for RejectHosts {
        async fn is_healthy(&self, proxy: &ProxyEndpoint) -> bool {
            !self.0.contains(&proxy.host)
        }
    }

    struct FixedList {
        proxies: Vec<ProxyEndpoint>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ProxySource for FixedList {
        async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.proxies.clone())
        }
    }

    fn endpoint(host: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            host: host.to_string(),
            port: 8080,
        }
    }

    fn reject(hosts: &[&str]) -> Arc<dyn ProxyProber> {
        Arc::new(RejectHosts(hosts.iter().map(|h| h.to_string()).collect()))
    }

    #[test]
    fn parses_list_lines() {
        let pool = parse_proxy_list("1.2.3.4:8080\r\nhttp://5.6.7.8:3128\r\n\r\ngarbage\r\n");
        assert_eq!(
            pool,
            vec![
                ProxyEndpoint { host: "1.2.3.4".into(), port: 8080 },
                ProxyEndpoint { host: "5.6.7.8".into(), port: 3128 },
            ]
        );
        assert_eq!(pool[1].url(), "http://5.6.7.8:3128");
    }

    #[tokio::test]
    async fn passthrough_without_source_or_pool() {
        let proxies = ProxyRotation::disabled();
        assert!(!proxies.is_enabled());
        assert_eq!(proxies.acquire().await, Ok(None));
        proxies.mark_active_bad().await;
        assert_eq!(proxies.acquire().await, Ok(None));
    }

    #[tokio::test]
    async fn active_proxy_is_reused_until_marked_bad() {
        let proxies = ProxyRotation::new(None, reject(&[]), vec![endpoint("a"), endpoint("b")]);
        let first = proxies.acquire().await.unwrap().unwrap();
        assert_eq!(proxies.acquire().await.unwrap().unwrap(), first);

        proxies.mark_active_bad().await;
        assert_eq!(proxies.pool_size().await, 1);
        let second = proxies.acquire().await.unwrap().unwrap();
        assert_ne!(second, first);
    }

    #[tokio::test]
    async fn unhealthy_members_are_evicted() {
        let proxies = ProxyRotation::new(None, reject(&["a", "b"]), vec![endpoint("a"), endpoint("b"), endpoint("c")]);
        assert_eq!(proxies.acquire().await.unwrap().unwrap().host, "c");
    }

    #[tokio::test]
    async fn single_endpoint_marked_bad_without_source_is_fatal() {
        let proxies = ProxyRotation::new(None, reject(&[]), vec![endpoint("a")]);
        proxies.acquire().await.unwrap();
        proxies.mark_active_bad().await;
        assert_eq!(proxies.acquire().await, Err(FatalError::ProxyPoolExhausted));
    }

    #[tokio::test]
    async fn exhaustion_refreshes_once_before_failing() {
        let source = Arc::new(FixedList {
            proxies: vec![endpoint("fresh")],
            fetches: AtomicUsize::new(0),
        });
        let proxies = ProxyRotation::new(Some(source.clone()), reject(&["stale"]), vec![endpoint("stale")]);
        assert_eq!(proxies.acquire().await.unwrap().unwrap().host, "fresh");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let dead = Arc::new(FixedList {
            proxies: vec![endpoint("stale")],
            fetches: AtomicUsize::new(0),
        });
        let proxies = ProxyRotation::new(Some(dead.clone()), reject(&["stale"]), Vec::new());
        assert_eq!(proxies.acquire().await, Err(FatalError::ProxyPoolExhausted));
        assert_eq!(dead.fetches.load(Ordering::SeqCst), 1);
    }
}
