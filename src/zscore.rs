//! Pair cointegration testing and rolling z-score signals.
//!
//! The statistical layer is pure-float and advisory: it never touches
//! on-chain amounts. Pair universe = all base-token pairs plus the first two
//! base tokens crossed with the top liquidity-ranked alt tokens from the
//! pools listing API. Cointegration results cache on a long TTL, z-scores
//! on a short one.

use ethers::types::{Address, U256};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorClient, QuoteOptions};
use crate::config::{Config, PRICE_SAMPLE_INTERVAL_SECS, POOLS_API_BASE};
use crate::error::EngineError;
use crate::rate_limit::ApiRateLimiters;
use crate::registry::TokenRegistry;
use crate::types::{
    amount_to_f64, CointegrationStats, DexId, PairKind, PriceSample, RouteSource, TokenPair,
};

/// ADF critical values at 1%, 5%, 10%.
const ADF_CRITICAL_VALUES: [f64; 3] = [-3.43, -2.86, -2.57];

/// Mean-reversion half-life ceiling (samples).
const MAX_HALF_LIFE: f64 = 100.0;

/// Hurst ceiling; above this the residuals trend rather than revert.
const MAX_HURST: f64 = 0.7;

/// Cointegration results are re-used for an hour.
const COINT_TTL: Duration = Duration::from_secs(3_600);

/// Z-scores are re-used for a few seconds.
const ZSCORE_TTL: Duration = Duration::from_secs(5);

/// Fraction of the lookback that must be present on each leg.
const MIN_SAMPLE_FRACTION: f64 = 0.8;

/// Fraction of the window required for a z-score.
const MIN_WINDOW_FRACTION: f64 = 0.7;

/// Trading signal for a cointegrated pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSignal {
    ShortALongB,
    LongAShortB,
    ClosePosition,
    Hold,
}

/// Signal with its supporting statistics.
#[derive(Debug, Clone, Copy)]
pub struct PairSignal {
    pub signal: TradeSignal,
    pub zscore: f64,
    pub confidence: f64,
    pub stats: CointegrationStats,
}

// === Pure statistics ===

/// Ordinary least squares of y on x, closed form.
/// Returns (slope, intercept, r_squared).
pub fn ols_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len().min(y.len());
    if n < 3 {
        return None;
    }
    let x = &x[..n];
    let y = &y[..n];
    let nf = n as f64;
    let mean_x = x.iter().sum::<f64>() / nf;
    let mean_y = y.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let dx = x[i] - mean_x;
        let dy = y[i] - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
    Some((slope, intercept, r_squared))
}

/// Augmented Dickey–Fuller statistic at lag 1:
/// Δr_t = α + β·r_{t-1} + γ·Δr_{t-1}, statistic = β / SE(β).
pub fn adf_statistic(residuals: &[f64]) -> f64 {
    let n = residuals.len();
    if n < 6 {
        return 0.0;
    }

    // Rows: t from 2..n, regressors [1, r_{t-1}, Δr_{t-1}], target Δr_t
    let rows = n - 2;
    let mut x = Vec::with_capacity(rows);
    let mut y = Vec::with_capacity(rows);
    for t in 2..n {
        x.push([1.0, residuals[t - 1], residuals[t - 1] - residuals[t - 2]]);
        y.push(residuals[t] - residuals[t - 1]);
    }

    // Normal equations X'X b = X'y for the 3-parameter model
    let mut xtx = [[0.0f64; 3]; 3];
    let mut xty = [0.0f64; 3];
    for (row, &target) in x.iter().zip(y.iter()) {
        for i in 0..3 {
            xty[i] += row[i] * target;
            for j in 0..3 {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    let Some(inv) = invert3(&xtx) else {
        return 0.0;
    };
    let mut beta = [0.0f64; 3];
    for i in 0..3 {
        for j in 0..3 {
            beta[i] += inv[i][j] * xty[j];
        }
    }

    // Residual variance and the standard error of the r_{t-1} coefficient
    let mut rss = 0.0;
    for (row, &target) in x.iter().zip(y.iter()) {
        let fitted: f64 = (0..3).map(|i| beta[i] * row[i]).sum();
        let e = target - fitted;
        rss += e * e;
    }
    let dof = rows.saturating_sub(3);
    if dof == 0 {
        return 0.0;
    }
    let sigma2 = rss / dof as f64;
    let se = (sigma2 * inv[1][1]).sqrt();
    if se == 0.0 || !se.is_finite() {
        return 0.0;
    }
    beta[1] / se
}

fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut out = [[0.0f64; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let a = m[(i + 1) % 3][(j + 1) % 3] * m[(i + 2) % 3][(j + 2) % 3]
                - m[(i + 1) % 3][(j + 2) % 3] * m[(i + 2) % 3][(j + 1) % 3];
            // Transpose for the adjugate
            out[j][i] = a * inv_det;
        }
    }
    Some(out)
}

/// Mean-reversion half-life via AR(1) on the residuals:
/// λ = Σ(Δr_i · r_{i-1}) / Σ r_{i-1}², half-life = ln(2)/|λ|.
pub fn half_life(residuals: &[f64]) -> f64 {
    let n = residuals.len();
    if n < 3 {
        return f64::INFINITY;
    }
    let mut num = 0.0;
    let mut den = 0.0;
    for t in 1..n {
        let lag = residuals[t - 1];
        num += (residuals[t] - lag) * lag;
        den += lag * lag;
    }
    if den == 0.0 {
        return f64::INFINITY;
    }
    let lambda = num / den;
    if lambda == 0.0 {
        return f64::INFINITY;
    }
    (2.0f64).ln() / lambda.abs()
}

/// Hurst exponent via rescaled range over the cumulative demeaned series.
pub fn hurst_exponent(residuals: &[f64]) -> f64 {
    let n = residuals.len();
    if n < 32 {
        return 0.5;
    }

    let mut log_n = Vec::new();
    let mut log_rs = Vec::new();
    let mut window = 8usize;
    while window <= n / 2 {
        let chunks = n / window;
        let mut rs_sum = 0.0;
        let mut rs_count = 0;
        for c in 0..chunks {
            let chunk = &residuals[c * window..(c + 1) * window];
            let mean = chunk.iter().sum::<f64>() / window as f64;
            let mut cum = 0.0;
            let mut min_cum = f64::INFINITY;
            let mut max_cum = f64::NEG_INFINITY;
            let mut var = 0.0;
            for &v in chunk {
                cum += v - mean;
                min_cum = min_cum.min(cum);
                max_cum = max_cum.max(cum);
                var += (v - mean) * (v - mean);
            }
            let std = (var / window as f64).sqrt();
            if std > 0.0 {
                rs_sum += (max_cum - min_cum) / std;
                rs_count += 1;
            }
        }
        if rs_count > 0 {
            log_n.push((window as f64).ln());
            log_rs.push((rs_sum / rs_count as f64).ln());
        }
        window *= 2;
    }

    match ols_regression(&log_n, &log_rs) {
        Some((slope, _, _)) => slope.clamp(0.0, 1.0),
        None => 0.5,
    }
}

/// Full cointegration test over aligned price series.
pub fn test_cointegration(
    prices_a: &[f64],
    prices_b: &[f64],
    lookback: usize,
) -> CointegrationStats {
    let mut stats = CointegrationStats::default();
    let floor = (lookback as f64 * MIN_SAMPLE_FRACTION) as usize;
    if prices_a.len() < floor || prices_b.len() < floor {
        return stats;
    }

    let n = prices_a.len().min(prices_b.len()).min(lookback);
    let log_a: Vec<f64> = prices_a[prices_a.len() - n..].iter().map(|p| p.ln()).collect();
    let log_b: Vec<f64> = prices_b[prices_b.len() - n..].iter().map(|p| p.ln()).collect();

    let Some((slope, intercept, r_squared)) = ols_regression(&log_b, &log_a) else {
        return stats;
    };
    stats.slope = slope;
    stats.intercept = intercept;
    stats.r_squared = r_squared;

    let residuals: Vec<f64> = log_a
        .iter()
        .zip(log_b.iter())
        .map(|(a, b)| a - (slope * b + intercept))
        .collect();

    stats.adf_statistic = adf_statistic(&residuals);
    if stats.adf_statistic > ADF_CRITICAL_VALUES[0] {
        return stats;
    }

    stats.half_life = half_life(&residuals);
    if stats.half_life > MAX_HALF_LIFE {
        return stats;
    }

    stats.hurst_exponent = hurst_exponent(&residuals);
    if stats.hurst_exponent > MAX_HURST {
        return stats;
    }

    stats.cointegrated = true;
    stats
}

/// Z-score over a ratio history; None when the window is too thin or flat.
pub fn zscore_from_ratios(current: f64, history: &[f64], window_size: usize) -> Option<f64> {
    let floor = (window_size as f64 * MIN_WINDOW_FRACTION) as usize;
    if history.len() < floor {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let var = history.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        return None;
    }
    Some((current - mean) / std)
}

/// Signal extraction from a z-score against the configured thresholds.
pub fn signal_from_zscore(z: f64, entry: f64, exit: f64) -> TradeSignal {
    if z > entry {
        TradeSignal::ShortALongB
    } else if z < -entry {
        TradeSignal::LongAShortB
    } else if z.abs() < exit {
        TradeSignal::ClosePosition
    } else {
        TradeSignal::Hold
    }
}

/// Confidence in [0,1] from z-score magnitude, scaled by the pair's
/// mean-reversion quality.
pub fn signal_confidence(z: f64, stats: &CointegrationStats) -> f64 {
    let mut confidence = (z.abs() / 4.0).min(1.0);
    confidence *= if stats.hurst_exponent < 0.4 {
        1.2
    } else if stats.hurst_exponent > 0.6 {
        0.8
    } else {
        1.0
    };
    confidence *= if stats.half_life < 10.0 {
        1.3
    } else if stats.half_life > 30.0 {
        0.7
    } else {
        1.0
    };
    confidence.clamp(0.0, 1.0)
}

/// Parse one pools-API entry: base-token ids arrive as "network_0xaddr",
/// reserves as decimal strings.
fn parse_pool_token(entry: &serde_json::Value) -> Option<(Address, f64)> {
    let id = entry["relationships"]["base_token"]["data"]["id"].as_str()?;
    let address: Address = id.rsplit('_').next()?.parse().ok()?;
    let liquidity = entry["attributes"]["reserve_in_usd"]
        .as_str()?
        .parse::<f64>()
        .ok()?;
    Some((address, liquidity))
}

// === Engine ===

struct RingState {
    rings: FxHashMap<Address, VecDeque<PriceSample>>,
}

/// Pair discovery, cointegration testing, and signal extraction.
pub struct ZScoreEngine {
    settings: crate::config::ZScoreSettings,
    numeraire: Address,
    pairs: RwLock<Vec<TokenPair>>,
    prices: RwLock<RingState>,
    coint_cache: RwLock<FxHashMap<(Address, Address), (Instant, CointegrationStats)>>,
    zscore_cache: RwLock<FxHashMap<(Address, Address), (Instant, f64)>>,
    registry: Arc<TokenRegistry>,
    aggregator: Arc<AggregatorClient>,
    http: reqwest::Client,
    limiters: Arc<ApiRateLimiters>,
}

impl ZScoreEngine {
    pub fn new(
        config: &Config,
        numeraire: Address,
        registry: Arc<TokenRegistry>,
        aggregator: Arc<AggregatorClient>,
        limiters: Arc<ApiRateLimiters>,
    ) -> Self {
        Self {
            settings: config.zscore_settings.clone(),
            numeraire,
            pairs: RwLock::new(Vec::new()),
            prices: RwLock::new(RingState { rings: FxHashMap::default() }),
            coint_cache: RwLock::new(FxHashMap::default()),
            zscore_cache: RwLock::new(FxHashMap::default()),
            registry,
            aggregator,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build HTTP client"),
            limiters,
        }
    }

    /// Build the pair universe: every unordered base pair, plus the first
    /// two base tokens crossed with the top alt tokens by liquidity.
    pub async fn init_pairs(&self, pool: &crate::rpc::RpcPool) -> Result<usize, EngineError> {
        let bases = self.registry.base_tokens().await;
        let mut pairs = Vec::new();

        for i in 0..bases.len() {
            for j in (i + 1)..bases.len() {
                pairs.push(TokenPair::new(
                    bases[i].address,
                    bases[j].address,
                    PairKind::BaseBase,
                ));
            }
        }

        match self.fetch_top_alt_tokens().await {
            Ok(alts) => {
                for (alt, liquidity) in alts {
                    if self.registry.discover_token(pool, alt).await.is_err() {
                        continue;
                    }
                    self.registry.update_market_data(alt, 0.0, liquidity).await;
                    for base in bases.iter().take(2) {
                        if base.address != alt {
                            pairs.push(TokenPair::new(base.address, alt, PairKind::BaseAlt));
                        }
                    }
                }
            }
            Err(e) => warn!("[ZSCORE] alt-token discovery unavailable: {e}"),
        }

        let count = pairs.len();
        *self.pairs.write().await = pairs;
        info!("[ZSCORE] tracking {count} pairs");
        Ok(count)
    }

    /// Top alt tokens by pool liquidity from the pools listing API,
    /// deduplicated and thresholded.
    async fn fetch_top_alt_tokens(&self) -> Result<Vec<(Address, f64)>, EngineError> {
        self.limiters.acquire("pools").await;
        let url = format!("{POOLS_API_BASE}/networks/base/pools?page=1");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::TransportUnavailable(format!(
                "pools API: {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("pools schema: {e}")))?;

        let mut by_token: FxHashMap<Address, f64> = FxHashMap::default();
        for entry in body["data"].as_array().map(|d| d.as_slice()).unwrap_or(&[]) {
            if let Some((address, liquidity)) = parse_pool_token(entry) {
                if liquidity >= self.settings.min_alt_liquidity_usd {
                    *by_token.entry(address).or_insert(0.0) += liquidity;
                }
            }
        }

        let mut ranked: Vec<(Address, f64)> = by_token.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.settings.top_alt_tokens);
        Ok(ranked)
    }

    /// Tokens appearing in any tracked pair.
    pub async fn tracked_tokens(&self) -> Vec<Address> {
        let pairs = self.pairs.read().await;
        let mut out = Vec::new();
        for pair in pairs.iter() {
            if !out.contains(&pair.token_a) {
                out.push(pair.token_a);
            }
            if !out.contains(&pair.token_b) {
                out.push(pair.token_b);
            }
        }
        out
    }

    /// Push one oracle sample; the ring holds 1.5·W and truncates to W on
    /// overflow.
    pub async fn record_price(&self, token: Address, price_usd: f64, timestamp: i64) {
        if price_usd <= 0.0 || !price_usd.is_finite() {
            return;
        }
        let cap = self.settings.window_size + self.settings.window_size / 2;
        let mut state = self.prices.write().await;
        let ring = state.rings.entry(token).or_default();
        ring.push_back(PriceSample { price_usd, timestamp });
        if ring.len() > cap {
            while ring.len() > self.settings.window_size {
                ring.pop_front();
            }
        }
    }

    pub async fn price_history(&self, token: Address) -> Vec<f64> {
        self.prices
            .read()
            .await
            .rings
            .get(&token)
            .map(|r| r.iter().map(|s| s.price_usd).collect())
            .unwrap_or_default()
    }

    /// One oracle read for a token: quote one whole token into the
    /// numeraire through the on-chain quoter. Failures skip the sample.
    pub async fn sample_price(&self, token: Address) -> Option<f64> {
        if token == self.numeraire {
            return self.registry.price_usd(token).await;
        }
        let decimals = self.registry.decimals(token).await?;
        let numeraire_price = self.registry.price_usd(self.numeraire).await?;
        let numeraire_decimals = self.registry.decimals(self.numeraire).await?;

        let one = U256::exp10(decimals as usize);
        let quote = self
            .aggregator
            .quote(
                RouteSource::Dex(DexId::UniswapV3),
                token,
                self.numeraire,
                one,
                QuoteOptions::default(),
            )
            .await
            .ok()?;
        let out = amount_to_f64(quote.return_amount, numeraire_decimals);
        let price = out * numeraire_price;
        (price > 0.0).then_some(price)
    }

    /// Cointegration stats for a pair, cached on the long TTL.
    pub async fn cointegration(&self, pair: &TokenPair) -> CointegrationStats {
        let key = pair.key();
        if let Some((at, stats)) = self.coint_cache.read().await.get(&key) {
            if at.elapsed() < COINT_TTL {
                return *stats;
            }
        }

        let a = self.price_history(pair.token_a).await;
        let b = self.price_history(pair.token_b).await;
        let stats = test_cointegration(&a, &b, self.settings.lookback);

        self.coint_cache
            .write()
            .await
            .insert(key, (Instant::now(), stats));
        if stats.cointegrated {
            debug!(
                "[ZSCORE] pair {:?}/{:?} cointegrated (adf {:.2}, hl {:.1}, H {:.2})",
                pair.token_a, pair.token_b, stats.adf_statistic, stats.half_life,
                stats.hurst_exponent
            );
        }
        stats
    }

    /// Current signal for a pair; None when untested, not cointegrated, or
    /// the ratio window is too thin.
    pub async fn signal(&self, pair: &TokenPair) -> Option<PairSignal> {
        let stats = self.cointegration(pair).await;
        if !stats.cointegrated {
            return None;
        }

        let z = self.pair_zscore(pair).await?;
        let signal = signal_from_zscore(
            z,
            self.settings.entry_threshold,
            self.settings.exit_threshold,
        );
        Some(PairSignal {
            signal,
            zscore: z,
            confidence: signal_confidence(z, &stats),
            stats,
        })
    }

    async fn pair_zscore(&self, pair: &TokenPair) -> Option<f64> {
        let key = pair.key();
        if let Some((at, z)) = self.zscore_cache.read().await.get(&key) {
            if at.elapsed() < ZSCORE_TTL {
                return Some(*z);
            }
        }

        let a = self.price_history(pair.token_a).await;
        let b = self.price_history(pair.token_b).await;
        let n = a.len().min(b.len());
        if n == 0 {
            return None;
        }
        let ratios: Vec<f64> = (0..n)
            .filter(|&i| b[b.len() - n + i] != 0.0)
            .map(|i| a[a.len() - n + i] / b[b.len() - n + i])
            .collect();
        let current = *ratios.last()?;
        let history = &ratios[..ratios.len() - 1];
        let z = zscore_from_ratios(current, history, self.settings.window_size)?;

        self.zscore_cache
            .write()
            .await
            .insert(key, (Instant::now(), z));
        Some(z)
    }

    /// Pairs currently holding a cointegration verdict, for the scanner.
    pub async fn cointegrated_pairs(&self) -> Vec<(TokenPair, CointegrationStats)> {
        let pairs = self.pairs.read().await.clone();
        let mut out = Vec::new();
        for pair in pairs {
            let stats = self.cointegration(&pair).await;
            if stats.cointegrated {
                out.push((pair, stats));
            }
        }
        out
    }

    pub fn entry_threshold(&self) -> f64 {
        self.settings.entry_threshold
    }
}

/// Auto-discovery: re-enumerate the pair universe every 30 minutes so newly
/// liquid alt tokens enter tracking without a restart.
pub async fn run_auto_discovery_loop(engine: Arc<ZScoreEngine>, pool: Arc<crate::rpc::RpcPool>) {
    info!("[ZSCORE] auto-discovery loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(30 * 60));
    interval.tick().await; // init_pairs already ran at startup
    loop {
        interval.tick().await;
        match engine.init_pairs(&pool).await {
            Ok(n) => info!("[ZSCORE] pair universe refreshed ({n} pairs)"),
            Err(e) => warn!("[ZSCORE] pair refresh failed: {e}"),
        }
    }
}

/// Price sampler: one oracle read per tracked token every 30 s.
pub async fn run_price_sampler_loop(engine: Arc<ZScoreEngine>) {
    info!("[ZSCORE] price sampler started ({PRICE_SAMPLE_INTERVAL_SECS}s cadence)");
    let mut interval = tokio::time::interval(Duration::from_secs(PRICE_SAMPLE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let tokens = engine.tracked_tokens().await;
        let now = chrono::Utc::now().timestamp();
        let mut sampled = 0;
        for token in tokens {
            match engine.sample_price(token).await {
                Some(price) => {
                    engine.record_price(token, price, now).await;
                    sampled += 1;
                }
                None => debug!("[ZSCORE] sample skipped for {token:?}"),
            }
        }
        debug!("[ZSCORE] sampled {sampled} token prices");
    }
}

// =============================================================================
// TESTS
// =============================================================================
