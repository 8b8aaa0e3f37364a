//! Mempool observation and adversarial-condition vetoes.
//!
//! A dedicated subscriber streams pending transactions from one endpoint
//! into a bounded channel (overflow drops, never back-pressures the socket).
//! Each transaction is classified by selector and gas posture; a sliding
//! 60 s window of observations feeds four vetoes that gate execution.

use ethers::types::{Address, Bytes, H256, Transaction, U256};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::MEV_BLACKLIST_URL;
use crate::error::EngineError;
use crate::types::{gwei_to_wei, wei_to_gwei, Opportunity};

/// Sliding window horizon.
const WINDOW_HORIZON: Duration = Duration::from_secs(60);

/// Hard cap on retained observations.
const WINDOW_CAPACITY: usize = 2_048;

/// Bounded hand-off between the socket reader and the classifier.
const CHANNEL_CAPACITY: usize = 1_024;

/// Re-execution quiet period for a path.
const SIMILAR_EXECUTION_WINDOW: Duration = Duration::from_secs(30);

/// Average gas over same-selector pending swaps that marks a sandwich setup.
const SANDWICH_GAS_GWEI: f64 = 100.0;

/// Pending arbitrage-like transactions tolerated before the competition veto.
const MAX_COMPETING_ARBS: usize = 3;

/// Pending transactions overpaying 1.2× tolerated before the gas-war veto.
const MAX_OVERPAYING_TXS: usize = 5;

// V2/V3 swap entry points
const SWAP_SELECTORS: [[u8; 4]; 8] = [
    [0x38, 0xed, 0x17, 0x39], // swapExactTokensForTokens
    [0x7f, 0xf3, 0x6a, 0xb5], // swapExactETHForTokens
    [0x18, 0xcb, 0xaf, 0xe5], // swapExactTokensForETH
    [0x5c, 0x11, 0xd7, 0x95], // swapExactTokensForTokensSupportingFee
    [0x41, 0x4b, 0xf3, 0x89], // exactInputSingle
    [0x04, 0xe4, 0x5a, 0xaf], // exactInputSingle (router02)
    [0xc0, 0x4b, 0x8d, 0x59], // exactInput
    [0xb8, 0x58, 0x18, 0x3f], // exactInput (router02)
];

const MULTICALL_SELECTORS: [[u8; 4]; 2] = [
    [0xac, 0x96, 0x50, 0xd8], // multicall(bytes[])
    [0x5a, 0xe4, 0x01, 0xdc], // multicall(deadline,bytes[])
];

const FLASH_LOAN_SELECTORS: [[u8; 4]; 2] = [
    [0xab, 0x9c, 0x4b, 0x5d], // flashLoan (Aave V3)
    [0x42, 0xb0, 0xb7, 0x7c], // flashLoanSimple
];

const LIQUIDITY_SELECTORS: [[u8; 4]; 4] = [
    [0xe8, 0xe3, 0x37, 0x00], // addLiquidity
    [0xba, 0xa2, 0xab, 0xde], // removeLiquidity
    [0x88, 0x31, 0x64, 0x56], // mint (V3 position)
    [0x21, 0x9f, 0x5d, 0x17], // increaseLiquidity
];

/// Pending-transaction classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MevKind {
    Sandwich,
    Frontrun,
    Backrun,
    Arbitrage,
    LiquidityMev,
    None,
}

/// One classified mempool observation.
#[derive(Debug, Clone)]
pub struct PendingObservation {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub gas_price: U256,
    pub input: Bytes,
    pub kind: MevKind,
    pub confidence: f64,
    pub seen_at: Instant,
}

/// Selector + gas-posture classifier. Blacklisted senders are treated as
/// professional searchers regardless of shape.
pub fn classify_pending(
    to: Option<Address>,
    input: &Bytes,
    gas_price: U256,
    network_price: U256,
    blacklisted: bool,
) -> (MevKind, f64) {
    if blacklisted {
        return (MevKind::Arbitrage, 0.95);
    }
    if to.is_none() || input.len() < 4 {
        return (MevKind::None, 0.0);
    }
    let selector: [u8; 4] = [input[0], input[1], input[2], input[3]];

    if FLASH_LOAN_SELECTORS.contains(&selector) {
        return (MevKind::Arbitrage, 0.9);
    }
    if LIQUIDITY_SELECTORS.contains(&selector) {
        return (MevKind::LiquidityMev, 0.7);
    }
    if MULTICALL_SELECTORS.contains(&selector) {
        return (MevKind::Arbitrage, 0.5);
    }
    if SWAP_SELECTORS.contains(&selector) {
        if network_price.is_zero() {
            return (MevKind::Arbitrage, 0.3);
        }
        // integer ratio in percent to avoid float drift on exact ties
        let pct = gas_price
            .saturating_mul(U256::from(100u64))
            .checked_div(network_price)
            .unwrap_or_default()
            .as_u64();
        return if pct >= 200 {
            (MevKind::Frontrun, 0.8)
        } else if pct >= 120 {
            (MevKind::Sandwich, 0.6)
        } else if pct <= 90 {
            (MevKind::Backrun, 0.5)
        } else {
            (MevKind::Arbitrage, 0.4)
        };
    }
    (MevKind::None, 0.1)
}

/// True when the calldata mentions the token address anywhere in its
/// ABI-encoded words.
pub fn calldata_mentions_token(input: &Bytes, token: Address) -> bool {
    let needle = token.as_bytes();
    input.windows(20).any(|w| w == needle)
}

/// Stable signature of an opportunity's path for the timing veto.
fn path_signature(opp: &Opportunity) -> u64 {
    let mut tokens: Vec<Address> = opp.hops.iter().map(|h| h.from_token).collect();
    tokens.sort();
    let mut hasher = rustc_hash::FxHasher::default();
    for t in tokens {
        t.hash(&mut hasher);
    }
    hasher.finish()
}

/// Mempool observer and opportunity gatekeeper.
pub struct MevGuard {
    window: RwLock<VecDeque<PendingObservation>>,
    blacklist: RwLock<FxHashSet<Address>>,
    executed_paths: RwLock<FxHashMap<u64, Instant>>,
    max_gas_price: U256,
    max_gas_price_gwei: f64,
    http: reqwest::Client,
}

impl MevGuard {
    pub fn new(max_gas_price_gwei: f64) -> Self {
        Self {
            window: RwLock::new(VecDeque::with_capacity(256)),
            blacklist: RwLock::new(FxHashSet::default()),
            executed_paths: RwLock::new(FxHashMap::default()),
            max_gas_price: gwei_to_wei(max_gas_price_gwei),
            max_gas_price_gwei,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Load the known-bot address list. Failure leaves the blacklist empty;
    /// the classifier falls back to shape heuristics.
    pub async fn load_blacklist(&self) {
        let resp = match self.http.get(MEV_BLACKLIST_URL).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("[MEV] blacklist fetch returned {}", r.status());
                return;
            }
            Err(e) => {
                warn!("[MEV] blacklist unavailable: {e}");
                return;
            }
        };
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!("[MEV] blacklist read failed: {e}");
                return;
            }
        };
        let mut blacklist = self.blacklist.write().await;
        for line in body.lines() {
            if let Ok(addr) = line.trim().parse::<Address>() {
                blacklist.insert(addr);
            }
        }
        info!("[MEV] loaded {} blacklisted bot addresses", blacklist.len());
    }

    pub async fn is_blacklisted(&self, address: Address) -> bool {
        self.blacklist.read().await.contains(&address)
    }

    /// Classify and retain one pending transaction.
    pub async fn observe(&self, tx: &Transaction, network_price: U256) {
        let blacklisted = self.is_blacklisted(tx.from).await;
        let gas_price = tx
            .max_fee_per_gas
            .or(tx.gas_price)
            .unwrap_or_default();
        let (kind, confidence) =
            classify_pending(tx.to, &tx.input, gas_price, network_price, blacklisted);
        self.push(PendingObservation {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            gas_price,
            input: tx.input.clone(),
            kind,
            confidence,
            seen_at: Instant::now(),
        })
        .await;
    }

    pub async fn push(&self, obs: PendingObservation) {
        let mut window = self.window.write().await;
        if window.len() == WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(obs);
    }

    /// Drop observations past the horizon.
    pub async fn prune(&self) {
        let mut window = self.window.write().await;
        while let Some(front) = window.front() {
            if front.seen_at.elapsed() > WINDOW_HORIZON {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn window_len(&self) -> usize {
        self.window.read().await.len()
    }

    /// Note a path we just executed, for the timing veto.
    pub async fn record_execution(&self, opp: &Opportunity) {
        self.executed_paths
            .write()
            .await
            .insert(path_signature(opp), Instant::now());
    }

    /// Run the four vetoes. `Ok(())` means safe to execute.
    pub async fn check_opportunity(
        &self,
        opp: &Opportunity,
        network_price: U256,
        avg_block_time_secs: f64,
    ) -> Result<(), EngineError> {
        self.prune().await;
        let window = self.window.read().await;

        // 1. Mempool competition
        let arb_like = window
            .iter()
            .filter(|o| o.kind == MevKind::Arbitrage && o.confidence >= 0.4)
            .count();
        if arb_like > MAX_COMPETING_ARBS {
            return Err(EngineError::MEVVeto(format!(
                "High arbitrage competition: {arb_like} pending searcher transactions"
            )));
        }
        let path_tokens: Vec<Address> = opp.hops.iter().map(|h| h.from_token).collect();
        let similar = window.iter().any(|o| {
            o.kind != MevKind::None
                && path_tokens
                    .iter()
                    .any(|t| calldata_mentions_token(&o.input, *t))
        });
        if similar {
            return Err(EngineError::MEVVeto(
                "Similar path already pending in mempool".to_string(),
            ));
        }

        // 2. Gas safety
        if network_price > self.max_gas_price {
            return Err(EngineError::MEVVeto(format!(
                "Network gas {:.2} gwei above {:.2} gwei ceiling",
                wei_to_gwei(network_price),
                self.max_gas_price_gwei
            )));
        }
        if !network_price.is_zero() {
            let overpaying = window
                .iter()
                .filter(|o| {
                    o.gas_price.saturating_mul(U256::from(10u64))
                        > network_price.saturating_mul(U256::from(12u64))
                })
                .count();
            if overpaying > MAX_OVERPAYING_TXS {
                return Err(EngineError::MEVVeto(format!(
                    "Gas war in mempool: {overpaying} transactions overpaying 1.2x"
                )));
            }
        }

        // 3. Sandwich vulnerability on the first hop's router
        if let Some(first) = opp.hops.first() {
            let router = crate::aggregator::source_router(first.source);
            let mut by_selector: FxHashMap<[u8; 4], (usize, U256)> = FxHashMap::default();
            for o in window.iter() {
                if o.to != Some(router) || o.input.len() < 4 {
                    continue;
                }
                let sel = [o.input[0], o.input[1], o.input[2], o.input[3]];
                if !SWAP_SELECTORS.contains(&sel) {
                    continue;
                }
                let entry = by_selector.entry(sel).or_insert((0, U256::zero()));
                entry.0 += 1;
                entry.1 = entry.1 + o.gas_price;
            }
            for (count, gas_sum) in by_selector.values() {
                if *count >= 2 {
                    let avg_gwei = wei_to_gwei(*gas_sum / U256::from(*count as u64));
                    if avg_gwei > SANDWICH_GAS_GWEI {
                        return Err(EngineError::MEVVeto(
                            "Potential sandwich attack detected on first hop".to_string(),
                        ));
                    }
                }
            }
        }
        drop(window);

        // 4. Timing
        if let Some(at) = self.executed_paths.read().await.get(&path_signature(opp)) {
            if at.elapsed() < SIMILAR_EXECUTION_WINDOW {
                return Err(EngineError::MEVVeto(
                    "Similar opportunity executed under 30s ago".to_string(),
                ));
            }
        }
        if avg_block_time_secs < 1.5 {
            return Err(EngineError::MEVVeto(format!(
                "Block production too fast ({avg_block_time_secs:.2}s average)"
            )));
        }

        Ok(())
    }
}

/// Mempool subscriber: one dedicated WS connection feeding a bounded
/// channel; overflow drops the hash rather than back-pressuring the socket.
pub async fn run_mempool_subscriber(
    guard: Arc<MevGuard>,
    pool: Arc<crate::rpc::RpcPool>,
    gas_oracle: Arc<crate::gas::GasOracle>,
) {
    let ws_url = pool.ws_url();
    let (tx, mut rx) = mpsc::channel::<H256>(CHANNEL_CAPACITY);

    // Classifier half: resolve hashes to transactions and observe them.
    let classify_guard = guard.clone();
    let classify_pool = pool.clone();
    tokio::spawn(async move {
        while let Some(hash) = rx.recv().await {
            let fetched = classify_pool
                .execute(|provider| async move {
                    ethers::providers::Middleware::get_transaction(&*provider, hash).await
                })
                .await;
            if let Ok(Some(tx)) = fetched {
                let network_price = gas_oracle.network_price().await;
                classify_guard.observe(&tx, network_price).await;
            }
        }
    });

    // Prune half: keep the window inside its horizon even when quiet.
    let prune_guard = guard.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            prune_guard.prune().await;
        }
    });

    // Socket half with reconnect.
    loop {
        match subscribe_pending(&ws_url, &tx).await {
            Ok(()) => warn!("[MEV] mempool stream closed, reconnecting..."),
            Err(e) => warn!("[MEV] mempool stream error: {e} - reconnecting..."),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn subscribe_pending(ws_url: &str, tx: &mpsc::Sender<H256>) -> anyhow::Result<()> {
    let (mut ws, _) = connect_async(ws_url).await?;
    let subscribe = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["newPendingTransactions"],
    });
    ws.send(Message::Text(subscribe.to_string())).await?;
    info!("[MEV] subscribed to pending transactions on {ws_url}");

    let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                ws.send(Message::Ping(Vec::new())).await?;
            }
            msg = ws.next() => {
                let Some(msg) = msg else { return Ok(()) };
                match msg? {
                    Message::Text(text) => {
                        if let Some(hash) = parse_pending_notification(&text) {
                            // Bounded channel: drop on overflow
                            if tx.try_send(hash).is_err() {
                                debug!("[MEV] channel full, dropping pending tx");
                            }
                        }
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Extract the tx hash from an `eth_subscription` notification.
fn parse_pending_notification(text: &str) -> Option<H256> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let result = value.get("params")?.get("result")?;
    result.as_str()?.parse().ok()
}

// =============================================================================
// TESTS
// =============================================================================

// The sandwich veto's end-to-end scenario (exact reason string included)
// lives in tests/integration_tests.rs.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{addr, cycle_opportunity as opportunity};

    fn gwei(g: f64) -> U256 {
        gwei_to_wei(g)
    }

    fn swap_input() -> Bytes {
        // swapExactTokensForTokens selector + padding
        let mut data = vec![0x38, 0xed, 0x17, 0x39];
        data.extend_from_slice(&[0u8; 64]);
        Bytes::from(data)
    }

    fn observation(kind: MevKind, confidence: f64, gas: U256) -> PendingObservation {
        PendingObservation {
            hash: H256::zero(),
            from: addr(0xAA),
            to: Some(addr(0xBB)),
            gas_price: gas,
            input: Bytes::new(),
            kind,
            confidence,
            seen_at: Instant::now(),
        }
    }

    /// The veto reason for the shared test opportunity under `guard`.
    async fn veto(guard: &MevGuard, network_gwei: f64) -> String {
        guard
            .check_opportunity(&opportunity(), gwei(network_gwei), 2.0)
            .await
            .unwrap_err()
            .veto_reason()
    }

    #[test]
    fn test_classification() {
        let classify = |input: &Bytes, gas: U256, blacklisted| {
            classify_pending(Some(addr(1)), input, gas, gwei(1.0), blacklisted)
        };

        let flash = Bytes::from(vec![0xab, 0x9c, 0x4b, 0x5d, 0, 0, 0, 0]);
        assert_eq!(classify(&flash, gwei(1.0), false).0, MevKind::Arbitrage);
        let liq = Bytes::from(vec![0xe8, 0xe3, 0x37, 0x00]);
        assert_eq!(classify(&liq, gwei(1.0), false).0, MevKind::LiquidityMev);

        // Swap selectors classify by gas posture against the network price
        let swap = swap_input();
        assert_eq!(classify(&swap, gwei(2.5), false).0, MevKind::Frontrun);
        assert_eq!(classify(&swap, gwei(1.3), false).0, MevKind::Sandwich);
        assert_eq!(classify(&swap, gwei(0.8), false).0, MevKind::Backrun);
        assert_eq!(classify(&swap, gwei(1.0), false).0, MevKind::Arbitrage);

        // No target or no calldata never classifies
        let (kind, conf) = classify_pending(None, &swap, gwei(1.0), gwei(1.0), false);
        assert_eq!((kind, conf), (MevKind::None, 0.0));
        assert_eq!(classify(&Bytes::new(), gwei(1.0), false).0, MevKind::None);

        // A blacklisted sender is a searcher regardless of shape
        let (kind, conf) = classify(&Bytes::new(), gwei(1.0), true);
        assert_eq!(kind, MevKind::Arbitrage);
        assert!(conf >= 0.95);
    }

    #[tokio::test]
    async fn test_competition_vetoes() {
        // A clean mempool passes
        let guard = MevGuard::new(50.0);
        assert!(guard.check_opportunity(&opportunity(), gwei(1.0), 2.0).await.is_ok());

        // Too many pending searcher transactions
        for _ in 0..4 {
            guard.push(observation(MevKind::Arbitrage, 0.9, gwei(1.0))).await;
        }
        assert!(veto(&guard, 1.0).await.contains("competition"));

        // A pending transaction touching one of our path tokens
        let guard = MevGuard::new(50.0);
        let mut obs = observation(MevKind::Sandwich, 0.6, gwei(1.0));
        let mut data = vec![0x38, 0xed, 0x17, 0x39];
        data.extend_from_slice(addr(2).as_bytes()); // token in our path
        obs.input = Bytes::from(data);
        assert!(calldata_mentions_token(&obs.input, addr(2)));
        assert!(!calldata_mentions_token(&obs.input, addr(9)));
        guard.push(obs).await;
        assert!(veto(&guard, 1.0).await.contains("Similar path"));
    }

    #[tokio::test]
    async fn test_gas_safety_vetoes() {
        // Network gas above the configured ceiling
        let guard = MevGuard::new(2.0);
        assert!(veto(&guard, 3.0).await.contains("ceiling"));

        // More than 5 pending transactions overpaying 1.2x
        let guard = MevGuard::new(50.0);
        for _ in 0..6 {
            guard.push(observation(MevKind::None, 0.1, gwei(2.0))).await;
        }
        assert!(veto(&guard, 1.0).await.contains("Gas war"));
    }

    #[tokio::test]
    async fn test_timing_vetoes() {
        // A path we executed under 30s ago stays quiet
        let guard = MevGuard::new(50.0);
        guard.record_execution(&opportunity()).await;
        assert!(veto(&guard, 1.0).await.contains("30s"));

        // Sub-1.5s block production is too contested
        let fresh = MevGuard::new(50.0);
        let err = fresh
            .check_opportunity(&opportunity(), gwei(1.0), 1.0)
            .await
            .unwrap_err();
        assert!(err.veto_reason().contains("too fast"));
    }

    #[tokio::test]
    async fn test_window_bounded_and_stream_parsing() {
        let guard = MevGuard::new(50.0);
        for _ in 0..(WINDOW_CAPACITY + 100) {
            guard.push(observation(MevKind::None, 0.0, gwei(1.0))).await;
        }
        assert_eq!(guard.window_len().await, WINDOW_CAPACITY);

        let text = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":"0x1111111111111111111111111111111111111111111111111111111111111111"}}"#;
        assert_eq!(parse_pending_notification(text).unwrap(), H256::from([0x11; 32]));
        assert!(parse_pending_notification("not json").is_none());
    }
}
