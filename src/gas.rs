//! Gas oracle: rolling fee history, optimal EIP-1559 parameters, and
//! wait-or-go decisions.
//!
//! Fees are exact wei (`U256`) end to end; floats only appear in the
//! gas-used ratio and trend statistics. The sampler polls `eth_feeHistory`
//! every 15 s over five blocks with a single 60th-percentile reward lane.

use ethers::providers::Middleware;
use ethers::types::{BlockNumber, U256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::GAS_SAMPLE_INTERVAL_SECS;
use crate::metrics::Metrics;
use crate::rpc::RpcPool;
use crate::types::{gwei_to_wei, wei_to_gwei};

/// Bounded history length for the fee rings.
const MAX_FEE_SAMPLES: usize = 100;

/// Samples inspected by the falling-base-fee trigger.
const TREND_WINDOW: usize = 10;

/// Reward percentile requested from fee history.
const REWARD_PERCENTILE: f64 = 60.0;

/// Fallback priority fee when no reward samples exist yet (1.5 gwei).
const FALLBACK_PRIORITY_WEI: u64 = 1_500_000_000;

/// Transaction complexity scales the tip and sizes the gas limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxComplexity {
    Simple,
    Medium,
    Complex,
    FlashLoan,
}

impl TxComplexity {
    /// Tip multiplier in milli-units.
    fn multiplier_milli(&self) -> u64 {
        match self {
            TxComplexity::Simple => 1_000,
            TxComplexity::Medium => 1_050,
            TxComplexity::Complex => 1_100,
            TxComplexity::FlashLoan => 1_150,
        }
    }

    /// Execution gas on top of the 21k base.
    fn execution_gas(&self) -> u64 {
        match self {
            TxComplexity::Simple => 30_000,
            TxComplexity::Medium => 150_000,
            TxComplexity::Complex => 350_000,
            TxComplexity::FlashLoan => 600_000,
        }
    }
}

/// Urgency scales the tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxUrgency {
    Low,
    Normal,
    High,
    Urgent,
}

impl TxUrgency {
    fn multiplier_milli(&self) -> u64 {
        match self {
            TxUrgency::Low => 1_000,
            TxUrgency::Normal => 1_100,
            TxUrgency::High => 1_300,
            TxUrgency::Urgent => 1_500,
        }
    }
}

/// Recommended EIP-1559 parameters.
#[derive(Debug, Clone, Copy)]
pub struct GasParams {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas_limit: U256,
}

/// Outcome of `should_wait_for_better_gas`.
#[derive(Debug, Clone)]
pub struct WaitDecision {
    pub wait: bool,
    pub reason: Option<String>,
    pub wait_blocks: u64,
}

impl WaitDecision {
    fn wait(reason: &str, blocks: u64) -> Self {
        Self { wait: true, reason: Some(reason.to_string()), wait_blocks: blocks }
    }
}

struct GasState {
    base_fee_ring: VecDeque<U256>,
    priority_fee_ring: VecDeque<U256>,
    latest_base_fee: U256,
    /// Average gasUsedRatio over the sampled blocks
    utilization: f64,
    /// Average seconds between sampled blocks (for the timing veto)
    avg_block_time_secs: f64,
}

/// Rolling fee observer and fee recommender.
pub struct GasOracle {
    max_gas_price: U256,
    max_gas_price_gwei: f64,
    state: RwLock<GasState>,
    metrics: Arc<Metrics>,
}

impl GasOracle {
    pub fn new(max_gas_price_gwei: f64, metrics: Arc<Metrics>) -> Self {
        Self {
            max_gas_price: gwei_to_wei(max_gas_price_gwei),
            max_gas_price_gwei,
            state: RwLock::new(GasState {
                base_fee_ring: VecDeque::with_capacity(MAX_FEE_SAMPLES),
                priority_fee_ring: VecDeque::with_capacity(MAX_FEE_SAMPLES),
                latest_base_fee: U256::zero(),
                utilization: 0.0,
                avg_block_time_secs: 2.0,
            }),
            metrics,
        }
    }

    /// Pull one fee-history sample from the chain.
    pub async fn sample(&self, pool: &RpcPool) -> anyhow::Result<()> {
        let history = pool
            .execute(|provider| async move {
                provider
                    .fee_history(5u64, BlockNumber::Latest, &[REWARD_PERCENTILE])
                    .await
            })
            .await?;

        let latest_base_fee = history.base_fee_per_gas.last().copied().unwrap_or_default();
        let utilization = if history.gas_used_ratio.is_empty() {
            0.0
        } else {
            history.gas_used_ratio.iter().sum::<f64>() / history.gas_used_ratio.len() as f64
        };
        let avg_priority = average_reward(&history.reward);

        self.record_sample(latest_base_fee, avg_priority, utilization).await;
        Ok(())
    }

    /// Push one observation into the rings. Exposed so tests and the sampler
    /// share one code path.
    pub async fn record_sample(&self, base_fee: U256, avg_priority: U256, utilization: f64) {
        let mut state = self.state.write().await;
        if state.base_fee_ring.len() == MAX_FEE_SAMPLES {
            state.base_fee_ring.pop_front();
        }
        if state.priority_fee_ring.len() == MAX_FEE_SAMPLES {
            state.priority_fee_ring.pop_front();
        }
        state.base_fee_ring.push_back(base_fee);
        state.priority_fee_ring.push_back(avg_priority);
        state.latest_base_fee = base_fee;
        state.utilization = utilization;
        drop(state);

        self.metrics.set_gas_price_gwei(wei_to_gwei(base_fee + avg_priority));
    }

    pub async fn set_avg_block_time(&self, secs: f64) {
        self.state.write().await.avg_block_time_secs = secs;
    }

    pub async fn avg_block_time_secs(&self) -> f64 {
        self.state.read().await.avg_block_time_secs
    }

    pub async fn latest_base_fee(&self) -> U256 {
        self.state.read().await.latest_base_fee
    }

    /// Current network price estimate (base + recommended tip), for the MEV
    /// guard's gas-safety veto.
    pub async fn network_price(&self) -> U256 {
        let state = self.state.read().await;
        let samples: Vec<U256> = state.priority_fee_ring.iter().copied().collect();
        state.latest_base_fee + percentile_wei(&samples, 0.60)
    }

    pub fn max_gas_price(&self) -> U256 {
        self.max_gas_price
    }

    pub fn max_gas_price_gwei(&self) -> f64 {
        self.max_gas_price_gwei
    }

    /// Recommend EIP-1559 parameters for a transaction of the given shape.
    pub async fn optimal_gas_params(
        &self,
        complexity: TxComplexity,
        urgency: TxUrgency,
    ) -> GasParams {
        let state = self.state.read().await;
        let samples: Vec<U256> = state.priority_fee_ring.iter().copied().collect();
        drop(state);

        let base_priority = if samples.is_empty() {
            U256::from(FALLBACK_PRIORITY_WEI)
        } else {
            percentile_wei(&samples, 0.60)
        };

        // urgency × complexity applied in milli-units to stay in integers
        let combined_milli = urgency.multiplier_milli() * complexity.multiplier_milli() / 1_000;
        let priority = base_priority * U256::from(combined_milli) / U256::from(1_000u64);

        let base_fee = self.latest_base_fee().await;
        let mut max_fee = base_fee + priority;
        if max_fee > self.max_gas_price {
            max_fee = self.max_gas_price;
        }
        let priority = priority.min(max_fee);

        let gas_limit =
            U256::from((21_000 + complexity.execution_gas()) * 13 / 10);

        GasParams {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
            gas_limit,
        }
    }

    /// Wait-or-go heuristics over the expected economics and recent trend.
    pub async fn should_wait_for_better_gas(
        &self,
        estimated_gas_cost_usd: f64,
        expected_profit_usd: f64,
    ) -> WaitDecision {
        if expected_profit_usd > 0.0 && estimated_gas_cost_usd / expected_profit_usd > 0.30 {
            return WaitDecision::wait("Gas cost > 30% of profit", 3);
        }

        let state = self.state.read().await;
        if state.utilization > 0.90 {
            return WaitDecision::wait("Block utilization above 90%", 2);
        }

        let n = state.base_fee_ring.len();
        if n >= TREND_WINDOW {
            let window: Vec<U256> = state
                .base_fee_ring
                .iter()
                .skip(n - TREND_WINDOW)
                .copied()
                .collect();
            if falling_faster_than(&window, 0.05) {
                return WaitDecision::wait("Base fee falling, deferring", 2);
            }
        }

        WaitDecision { wait: false, reason: None, wait_blocks: 0 }
    }
}

/// Per-block decline rate of a fee series exceeds `rate`.
fn falling_faster_than(window: &[U256], rate: f64) -> bool {
    if window.len() < 2 {
        return false;
    }
    let first = wei_to_gwei(window[0]);
    let last = wei_to_gwei(window[window.len() - 1]);
    if first <= 0.0 || last >= first {
        return false;
    }
    let per_block = (first - last) / first / (window.len() - 1) as f64;
    per_block > rate
}

/// Nearest-rank percentile over exact wei samples.
fn percentile_wei(samples: &[U256], p: f64) -> U256 {
    if samples.is_empty() {
        return U256::from(FALLBACK_PRIORITY_WEI);
    }
    let mut sorted = samples.to_vec();
    sorted.sort();
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

/// Mean of the single-lane rewards across sampled blocks.
fn average_reward(reward: &[Vec<U256>]) -> U256 {
    let lanes: Vec<U256> = reward
        .iter()
        .filter_map(|block| block.first().copied())
        .collect();
    if lanes.is_empty() {
        return U256::from(FALLBACK_PRIORITY_WEI);
    }
    let sum = lanes.iter().fold(U256::zero(), |acc, r| acc + *r);
    sum / U256::from(lanes.len() as u64)
}

/// Sampler loop: one fee-history read every 15 s.
pub async fn run_gas_sampler_loop(oracle: Arc<GasOracle>, pool: Arc<RpcPool>) {
    info!("[GAS] sampler started ({GAS_SAMPLE_INTERVAL_SECS}s cadence)");
    let mut interval = tokio::time::interval(Duration::from_secs(GAS_SAMPLE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        match oracle.sample(&pool).await {
            Ok(()) => debug!(
                "[GAS] base fee {:.4} gwei",
                wei_to_gwei(oracle.latest_base_fee().await)
            ),
            Err(e) => warn!("[GAS] fee sample failed: {e}"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(g: f64) -> U256 {
        gwei_to_wei(g)
    }

    fn oracle(max_gwei: f64) -> GasOracle {
        GasOracle::new(max_gwei, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_optimal_gas_params() {
        // Empty ring: the 1.5 gwei fallback applies
        let o = oracle(50.0);
        let params = o.optimal_gas_params(TxComplexity::Simple, TxUrgency::Low).await;
        assert_eq!(params.max_priority_fee_per_gas, U256::from(FALLBACK_PRIORITY_WEI));
        assert!(params.max_fee_per_gas >= params.max_priority_fee_per_gas);

        // Hot network: everything clamps to the configured ceiling
        let capped = oracle(2.0);
        capped.record_sample(gwei(10.0), gwei(5.0), 0.5).await;
        let params = capped
            .optimal_gas_params(TxComplexity::FlashLoan, TxUrgency::Urgent)
            .await;
        assert!(params.max_fee_per_gas <= gwei(2.0));
        assert!(params.max_priority_fee_per_gas <= params.max_fee_per_gas);

        // urgency × complexity scales the tip: flash_loan 1.15 × urgent 1.5
        let o = oracle(1_000.0);
        for _ in 0..5 {
            o.record_sample(gwei(1.0), gwei(2.0), 0.5).await;
        }
        let low = o.optimal_gas_params(TxComplexity::Simple, TxUrgency::Low).await;
        let urgent = o
            .optimal_gas_params(TxComplexity::FlashLoan, TxUrgency::Urgent)
            .await;
        let expected = gwei(2.0) * U256::from(1_725u64) / U256::from(1_000u64);
        assert_eq!(urgent.max_priority_fee_per_gas, expected);
        // Limits sized per complexity: (21k + execution gas) × 1.3
        assert_eq!(low.gas_limit, U256::from((21_000u64 + 30_000) * 13 / 10));
        assert_eq!(urgent.gas_limit, U256::from((21_000u64 + 600_000) * 13 / 10));
    }

    // The gas-vs-profit wait decision (scenario text included) is asserted
    // in tests/integration_tests.rs.

    #[tokio::test]
    async fn test_wait_on_network_conditions() {
        // Congested blocks defer
        let o = oracle(50.0);
        o.record_sample(gwei(1.0), gwei(0.5), 0.95).await;
        let decision = o.should_wait_for_better_gas(0.1, 10.0).await;
        assert!(decision.wait);
        assert!(decision.reason.unwrap().contains("utilization"));

        // A base fee falling >5%/block defers
        let o = oracle(50.0);
        let mut fee = 10.0;
        for _ in 0..(MAX_FEE_SAMPLES + 20) {
            o.record_sample(gwei(fee), gwei(0.5), 0.4).await;
            fee *= 0.999;
        }
        for _ in 0..10 {
            o.record_sample(gwei(fee), gwei(0.5), 0.4).await;
            fee *= 0.90;
        }
        let decision = o.should_wait_for_better_gas(0.1, 10.0).await;
        assert!(decision.wait);
        assert!(decision.reason.unwrap().contains("falling"));

        // Rings stay bounded despite the long history
        let state = o.state.read().await;
        assert_eq!(state.base_fee_ring.len(), MAX_FEE_SAMPLES);
        assert_eq!(state.priority_fee_ring.len(), MAX_FEE_SAMPLES);
        drop(state);

        let samples: Vec<U256> = (1..=10).map(U256::from).collect();
        assert_eq!(percentile_wei(&samples, 0.60), U256::from(6u64));
        assert_eq!(percentile_wei(&samples, 1.0), U256::from(10u64));

        let rising: Vec<U256> = (1..=10).map(|i| gwei(i as f64)).collect();
        assert!(!falling_faster_than(&rising, 0.05));

        let reward = vec![vec![gwei(1.0)], vec![gwei(2.0)], vec![gwei(3.0)]];
        assert_eq!(average_reward(&reward), gwei(2.0));
        assert_eq!(average_reward(&[]), U256::from(FALLBACK_PRIORITY_WEI));
    }
}
