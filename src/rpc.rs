//! Multi-endpoint RPC transport with token-bucket limiting and health
//! tracking.
//!
//! Every call is routed through the endpoint's per-minute bucket and then
//! its per-second bucket. Three consecutive failures park an endpoint as
//! unhealthy until a probe (a lightweight block-number read) succeeds.
//! Transport errors surface to the caller; retry policy lives above.

use ethers::providers::{Http, Middleware, Provider, ProviderError};
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::RpcSettings;
use crate::error::EngineError;
use crate::metrics::Metrics;

/// Consecutive failures before an endpoint is marked unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// In-flight bound on the per-second stage.
const SECOND_STAGE_CONCURRENCY: usize = 4;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// One chain endpoint with its limiters and health state.
pub struct RpcEndpoint {
    pub url: String,
    provider: Arc<Provider<Http>>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Unix millis of the last probe attempt while unhealthy
    last_checked_ms: AtomicI64,
    minute_bucket: DirectLimiter,
    second_bucket: DirectLimiter,
    /// max-concurrent 1 on the minute stage guards its token accounting
    minute_gate: Semaphore,
    /// small in-flight bound on the second stage
    second_gate: Semaphore,
}

impl RpcEndpoint {
    pub fn new(url: &str, settings: &RpcSettings) -> Result<Self, EngineError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| EngineError::ConfigInvalid(vec![format!("rpc url {url}: {e}")]))?
            .interval(Duration::from_millis(500));

        let per_second = NonZeroU32::new(settings.max_requests_per_second.max(1))
            .expect("nonzero per-second budget");
        let per_minute = NonZeroU32::new(settings.max_requests_per_minute.max(1))
            .expect("nonzero per-minute budget");

        Ok(Self {
            url: url.to_string(),
            provider: Arc::new(provider),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_checked_ms: AtomicI64::new(0),
            minute_bucket: RateLimiter::direct(Quota::per_minute(per_minute)),
            second_bucket: RateLimiter::direct(Quota::per_second(per_second)),
            minute_gate: Semaphore::new(1),
            second_gate: Semaphore::new(SECOND_STAGE_CONCURRENCY),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    /// A successful call resets the failure counter. Health is only
    /// restored by a probe, so an unhealthy endpoint stays parked even if a
    /// fallback call through it happens to succeed.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Returns true when this failure tripped the endpoint unhealthy.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER_FAILURES && self.is_healthy() {
            self.healthy.store(false, Ordering::Release);
            self.touch_checked();
            return true;
        }
        false
    }

    pub fn restore(&self) {
        self.healthy.store(true, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn touch_checked(&self) {
        self.last_checked_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn due_for_probe(&self, unhealthy_timeout_ms: u64) -> bool {
        let last = self.last_checked_ms.load(Ordering::Acquire);
        chrono::Utc::now().timestamp_millis() - last >= unhealthy_timeout_ms as i64
    }

    /// Pass through both buckets, minute stage first.
    async fn throttle(&self) {
        {
            let _gate = self.minute_gate.acquire().await.expect("gate open");
            self.minute_bucket.until_ready().await;
        }
        let _gate = self.second_gate.acquire().await.expect("gate open");
        self.second_bucket.until_ready().await;
    }
}

/// Ordered endpoint pool with a round-robin cursor.
pub struct RpcPool {
    endpoints: Vec<Arc<RpcEndpoint>>,
    cursor: AtomicUsize,
    settings: RpcSettings,
    metrics: Arc<Metrics>,
}

impl RpcPool {
    pub fn new(urls: &[String], settings: RpcSettings, metrics: Arc<Metrics>) -> Result<Self, EngineError> {
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            endpoints.push(Arc::new(RpcEndpoint::new(url, &settings)?));
        }
        if endpoints.is_empty() {
            return Err(EngineError::ConfigInvalid(vec![
                "rpc_nodes: at least one endpoint required".to_string(),
            ]));
        }
        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
            settings,
            metrics,
        })
    }

    pub fn endpoints(&self) -> &[Arc<RpcEndpoint>] {
        &self.endpoints
    }

    /// Next healthy endpoint by round-robin; if the whole ring is unhealthy,
    /// return the cursor's endpoint anyway and log.
    pub fn endpoint(&self) -> Arc<RpcEndpoint> {
        let n = self.endpoints.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let candidate = &self.endpoints[(start + i) % n];
            if candidate.is_healthy() {
                return candidate.clone();
            }
        }
        let fallback = &self.endpoints[start % n];
        warn!("[RPC] no healthy endpoints, falling back to {}", fallback.url);
        fallback.clone()
    }

    /// WebSocket URL derived from the first endpoint, for the mempool
    /// subscriber.
    pub fn ws_url(&self) -> String {
        let url = &self.endpoints[0].url;
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }

    /// Route one provider call through an endpoint's buckets and health
    /// accounting. The closure gets a provider handle; its error is treated
    /// as an endpoint failure.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Provider<Http>>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let endpoint = self.endpoint();
        endpoint.throttle().await;
        self.metrics.inc_rpc_requests();

        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        let result = tokio::time::timeout(timeout, f(endpoint.provider())).await;

        let reason = match result {
            Ok(Ok(value)) => {
                endpoint.record_success();
                return Ok(value);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.settings.request_timeout_ms),
        };
        self.metrics.inc_rpc_errors();
        if endpoint.record_failure() {
            warn!("[RPC] endpoint {} marked unhealthy: {reason}", endpoint.url);
        }
        Err(EngineError::TransportUnavailable(format!("{}: {reason}", endpoint.url)))
    }

    /// Probe one unhealthy endpoint if its quiet period elapsed. Exposed for
    /// the health-check loop and tests.
    pub async fn probe_unhealthy(&self) {
        for endpoint in &self.endpoints {
            if endpoint.is_healthy() || !endpoint.due_for_probe(self.settings.unhealthy_timeout_ms)
            {
                continue;
            }
            endpoint.touch_checked();
            let timeout = Duration::from_millis(self.settings.request_timeout_ms);
            match tokio::time::timeout(timeout, endpoint.provider().get_block_number()).await {
                Ok(Ok(block)) => {
                    endpoint.restore();
                    info!("[RPC] endpoint {} healthy again at block {block}", endpoint.url);
                }
                Ok(Err(e)) => {
                    debug!("[RPC] probe of {} failed: {e}", endpoint.url);
                }
                Err(_) => {
                    debug!("[RPC] probe of {} timed out", endpoint.url);
                }
            }
        }
    }
}

/// Health-check loop: probes unhealthy endpoints on the configured cadence.
pub async fn run_health_check_loop(pool: Arc<RpcPool>) {
    let interval_ms = pool.settings.health_check_interval_ms.max(100);
    info!("[RPC] health-check loop started ({interval_ms}ms cadence)");
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        pool.probe_unhealthy().await;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcSettings;

    fn pool_with(urls: &[&str]) -> RpcPool {
        let urls: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
        RpcPool::new(&urls, RpcSettings::default(), Arc::new(Metrics::new())).unwrap()
    }

    // Failover and probe-restore behavior is covered end to end in
    // tests/integration_tests.rs.

    #[test]
    fn test_health_state_machine() {
        let pool = pool_with(&["http://one.invalid", "http://two.invalid"]);
        let ep = pool.endpoints()[0].clone();

        // A success mid-streak resets the counter
        ep.record_failure();
        ep.record_failure();
        ep.record_success();
        assert_eq!(ep.failure_count(), 0);
        assert!(ep.is_healthy());

        // The third consecutive failure trips
        assert!(!ep.record_failure());
        assert!(!ep.record_failure());
        assert!(ep.record_failure());
        assert!(!ep.is_healthy());

        // With every endpoint unhealthy, selection still returns one
        for _ in 0..3 {
            pool.endpoints()[1].record_failure();
        }
        assert!(!pool.endpoint().is_healthy());
    }

    #[test]
    fn test_round_robin_and_ws_url() {
        let pool = pool_with(&["https://mainnet.base.org", "http://two.invalid"]);
        let first = pool.endpoint().url.clone();
        let second = pool.endpoint().url.clone();
        assert_ne!(first, second);
        // The mempool subscriber derives its socket from the first endpoint
        assert_eq!(pool.ws_url(), "wss://mainnet.base.org");
    }

    #[tokio::test]
    async fn test_execute_surfaces_transport_error() {
        // Unroutable address: the call errors, surfaces as
        // TransportUnavailable, and counts one failure
        let mut settings = RpcSettings::default();
        settings.request_timeout_ms = 500;
        let pool =
            RpcPool::new(&["http://127.0.0.1:1".to_string()], settings, Arc::new(Metrics::new()))
                .unwrap();

        let result = pool
            .execute(|provider| async move { provider.get_block_number().await })
            .await;
        assert!(matches!(result, Err(EngineError::TransportUnavailable(_))));
        assert_eq!(pool.endpoints()[0].failure_count(), 1);
    }
}
