//! Net-profit accounting: gas, flash-loan premium, and slippage modeling.
//!
//! All on-chain quantities stay exact integers; USD figures are display
//! floats derived at the edges. Slippage is estimated and applied per hop,
//! then the per-hop USD sum is multiplied by a 1.5 global buffer: hop
//! minimums already carry their source's base slippage, the buffer protects
//! the aggregate.

use ethers::types::{Address, Bytes, U256};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::gas::GasOracle;
use crate::registry::TokenRegistry;
use crate::types::{amount_to_usd, Opportunity, RouteSource};
use crate::zscore::ZScoreEngine;

/// Flash-loan transaction overhead on top of hop gas.
const FLASH_LOAN_OVERHEAD_GAS: u64 = 250_000;

/// Safety buffer on modeled (non-simulated) gas.
const GAS_BUFFER_NUM: u64 = 3;
const GAS_BUFFER_DEN: u64 = 2;

/// Global multiplier over the summed per-hop slippage.
const SLIPPAGE_BUFFER: f64 = 1.5;

/// Per-hop slippage clamp.
const MIN_HOP_SLIPPAGE: f64 = 1e-4;
const MAX_HOP_SLIPPAGE: f64 = 0.1;

/// Samples considered for the volatility factor.
const VOLATILITY_WINDOW: usize = 20;

/// Tenderly-compatible remote simulator credentials.
#[derive(Debug, Clone)]
pub struct SimulatorCreds {
    pub account: String,
    pub project: String,
    pub access_key: String,
}

impl SimulatorCreds {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            account: std::env::var("TENDERLY_ACCOUNT").ok()?,
            project: std::env::var("TENDERLY_PROJECT").ok()?,
            access_key: std::env::var("TENDERLY_ACCESS_KEY").ok()?,
        })
    }
}

/// Encoded call handed to the remote simulator.
#[derive(Debug, Clone)]
pub struct SimulationCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub gas_limit: u64,
}

/// USD breakdown of an opportunity's economics.
#[derive(Debug, Clone, Copy)]
pub struct ProfitBreakdown {
    pub gross_profit_usd: f64,
    pub gas_cost_usd: f64,
    pub flash_loan_cost_usd: f64,
    pub slippage_buffer_usd: f64,
    pub net_profit_usd: f64,
    pub net_profit_percent: f64,
    pub meets_threshold: bool,
}

// === Slippage sub-model ===

/// Deeper pools slip less. Non-increasing in liquidity.
pub fn liquidity_factor(liquidity_usd: f64) -> f64 {
    if liquidity_usd >= 1_000_000.0 {
        1.0
    } else if liquidity_usd >= 500_000.0 {
        1.2
    } else if liquidity_usd >= 100_000.0 {
        1.5
    } else if liquidity_usd >= 50_000.0 {
        2.0
    } else {
        3.0
    }
}

/// Bigger notionals slip more.
pub fn amount_factor(notional_usd: f64) -> f64 {
    if notional_usd < 10_000.0 {
        1.0
    } else if notional_usd < 50_000.0 {
        1.3
    } else if notional_usd < 100_000.0 {
        1.6
    } else {
        2.0
    }
}

/// Choppy markets slip more; input is the sample std of recent returns.
pub fn volatility_factor(returns_std: f64) -> f64 {
    if returns_std < 0.01 {
        1.0
    } else if returns_std < 0.03 {
        1.5
    } else if returns_std < 0.06 {
        2.0
    } else {
        2.5
    }
}

/// Per-hop slippage fraction, clamped.
pub fn estimate_hop_slippage(
    source: RouteSource,
    liquidity_usd: f64,
    notional_usd: f64,
    returns_std: f64,
) -> f64 {
    let raw = source.base_slippage()
        * liquidity_factor(liquidity_usd)
        * amount_factor(notional_usd)
        * volatility_factor(returns_std);
    raw.clamp(MIN_HOP_SLIPPAGE, MAX_HOP_SLIPPAGE)
}

/// Sample standard deviation of log returns over the recent window.
pub fn returns_std(prices: &[f64]) -> f64 {
    let start = prices.len().saturating_sub(VOLATILITY_WINDOW + 1);
    let window = &prices[start..];
    if window.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

/// Assemble the final breakdown from its USD parts.
pub fn compose_breakdown(
    gross_profit_usd: f64,
    gas_cost_usd: f64,
    flash_loan_cost_usd: f64,
    slippage_buffer_usd: f64,
    input_value_usd: f64,
    min_profit_threshold_usd: f64,
) -> ProfitBreakdown {
    let net_profit_usd =
        gross_profit_usd - gas_cost_usd - flash_loan_cost_usd - slippage_buffer_usd;
    let net_profit_percent = if input_value_usd > 0.0 {
        net_profit_usd / input_value_usd * 100.0
    } else {
        0.0
    };
    ProfitBreakdown {
        gross_profit_usd,
        gas_cost_usd,
        flash_loan_cost_usd,
        slippage_buffer_usd,
        net_profit_usd,
        net_profit_percent,
        meets_threshold: net_profit_usd >= min_profit_threshold_usd,
    }
}

/// The accountant: prices paths, models costs, and simulates candidates.
pub struct ProfitAccountant {
    registry: Arc<TokenRegistry>,
    gas_oracle: Arc<GasOracle>,
    zscore: Arc<ZScoreEngine>,
    /// Gas is priced in the chain's native asset
    native_token: Address,
    min_profit_threshold_usd: f64,
    flash_loan_premium_bps: u64,
    simulator: Option<SimulatorCreds>,
    http: reqwest::Client,
}

impl ProfitAccountant {
    pub fn new(
        registry: Arc<TokenRegistry>,
        gas_oracle: Arc<GasOracle>,
        zscore: Arc<ZScoreEngine>,
        native_token: Address,
        min_profit_threshold_usd: f64,
        flash_loan_premium_bps: u64,
    ) -> Self {
        Self {
            registry,
            gas_oracle,
            zscore,
            native_token,
            min_profit_threshold_usd,
            flash_loan_premium_bps,
            simulator: SimulatorCreds::from_env(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    async fn token_price(&self, token: Address) -> Result<f64, EngineError> {
        if let Some(price) = self.registry.price_usd(token).await {
            return Ok(price);
        }
        // Quoter fallback through the statistical sampler's oracle path
        if let Some(price) = self.zscore.sample_price(token).await {
            return Ok(price);
        }
        Err(EngineError::QuoteUnavailable(format!(
            "no USD price for {token:?}"
        )))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, EngineError> {
        self.registry
            .decimals(token)
            .await
            .ok_or_else(|| EngineError::QuoteUnavailable(format!("unknown token {token:?}")))
    }

    /// Full cost model for an opportunity. `simulated_gas` overrides the
    /// modeled gas (and skips the modeling buffer) when a simulation ran.
    pub async fn analyze(
        &self,
        opp: &Opportunity,
        simulated_gas: Option<u64>,
    ) -> Result<ProfitBreakdown, EngineError> {
        let flash_asset = opp
            .flash_asset()
            .ok_or_else(|| EngineError::Internal("opportunity with no hops".into()))?;
        let asset_price = self.token_price(flash_asset).await?;
        let asset_decimals = self.token_decimals(flash_asset).await?;

        let input_value_usd = amount_to_usd(opp.amount_in, asset_decimals, asset_price);
        let output_value_usd = amount_to_usd(opp.expected_out, asset_decimals, asset_price);
        let gross_profit_usd = output_value_usd - input_value_usd;

        // Gas: exact units × exact wei price, priced in the native asset
        let gas_units = match simulated_gas {
            Some(units) => units,
            None => {
                (21_000 + opp.total_hop_gas() + FLASH_LOAN_OVERHEAD_GAS) * GAS_BUFFER_NUM
                    / GAS_BUFFER_DEN
            }
        };
        let gas_price = self.gas_oracle.network_price().await;
        let gas_cost_wei = U256::from(gas_units) * gas_price;
        let native_price = self.token_price(self.native_token).await?;
        let gas_cost_usd = amount_to_usd(gas_cost_wei, 18, native_price);

        // Flash premium in the loan asset's smallest units
        let premium = opp.amount_in * U256::from(self.flash_loan_premium_bps)
            / U256::from(10_000u64);
        let flash_loan_cost_usd = amount_to_usd(premium, asset_decimals, asset_price);

        // Per-hop slippage, summed in USD, then the global buffer
        let mut slippage_usd = 0.0;
        for hop in &opp.hops {
            let hop_price = self.token_price(hop.from_token).await?;
            let hop_decimals = self.token_decimals(hop.from_token).await?;
            let notional_usd = amount_to_usd(hop.amount_in, hop_decimals, hop_price);

            let liq_from = self.registry.liquidity_usd(hop.from_token).await;
            let liq_to = self.registry.liquidity_usd(hop.to_token).await;
            let liquidity = match (liq_from > 0.0, liq_to > 0.0) {
                (true, true) => liq_from.min(liq_to),
                (true, false) => liq_from,
                (false, true) => liq_to,
                (false, false) => opp.path_liquidity_usd.max(0.0),
            };

            let vol = returns_std(&self.zscore.price_history(hop.from_token).await);
            let fraction = estimate_hop_slippage(hop.source, liquidity, notional_usd, vol);
            slippage_usd += fraction * notional_usd;
        }
        let slippage_buffer_usd = slippage_usd * SLIPPAGE_BUFFER;

        let breakdown = compose_breakdown(
            gross_profit_usd,
            gas_cost_usd,
            flash_loan_cost_usd,
            slippage_buffer_usd,
            input_value_usd,
            self.min_profit_threshold_usd,
        );
        debug!(
            "[PROFIT] opp {} gross ${:.2} gas ${:.2} flash ${:.2} slip ${:.2} net ${:.2}",
            opp.id,
            breakdown.gross_profit_usd,
            breakdown.gas_cost_usd,
            breakdown.flash_loan_cost_usd,
            breakdown.slippage_buffer_usd,
            breakdown.net_profit_usd
        );
        Ok(breakdown)
    }

    /// Simulate a candidate. Remote simulation when credentials and an
    /// encoded call are available; local re-pricing otherwise. Success means
    /// strictly positive projected net profit.
    pub async fn simulate(
        &self,
        opp: &Opportunity,
        call: Option<&SimulationCall>,
        chain_id: u64,
    ) -> Result<ProfitBreakdown, EngineError> {
        let simulated_gas = match (&self.simulator, call) {
            (Some(creds), Some(call)) => match self.simulate_remote(creds, call, chain_id).await {
                Ok(gas) => Some(gas),
                Err(e) => {
                    warn!("[PROFIT] remote simulation unavailable, falling back local: {e}");
                    None
                }
            },
            _ => None,
        };

        let breakdown = self.analyze(opp, simulated_gas).await?;
        if breakdown.net_profit_usd > 0.0 {
            Ok(breakdown)
        } else {
            Err(EngineError::SimulationFailed(format!(
                "projected net ${:.2} not positive",
                breakdown.net_profit_usd
            )))
        }
    }

    async fn simulate_remote(
        &self,
        creds: &SimulatorCreds,
        call: &SimulationCall,
        chain_id: u64,
    ) -> Result<u64, EngineError> {
        let url = format!(
            "https://api.tenderly.co/api/v1/account/{}/project/{}/simulate",
            creds.account, creds.project
        );
        let payload = json!({
            "network_id": chain_id.to_string(),
            "from": format!("{:#x}", call.from),
            "to": format!("{:#x}", call.to),
            "input": format!("0x{}", hex::encode(&call.data)),
            "gas": call.gas_limit,
            "save": false,
        });

        let resp = self
            .http
            .post(&url)
            .header("X-Access-Key", &creds.access_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::SimulationFailed(format!("simulator: {e}")))?;
        if !resp.status().is_success() {
            return Err(EngineError::SimulationFailed(format!(
                "simulator: HTTP {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::SimulationFailed(format!("simulator schema: {e}")))?;

        let tx = body
            .get("transaction")
            .ok_or_else(|| EngineError::SimulationFailed("simulator: no transaction".into()))?;
        let status = tx.get("status").and_then(|s| s.as_bool()).unwrap_or(false);
        if !status {
            return Err(EngineError::SimulationFailed(
                "simulator: transaction reverted".to_string(),
            ));
        }
        tx.get("gas_used")
            .and_then(|g| g.as_u64())
            .ok_or_else(|| EngineError::SimulationFailed("simulator: no gas_used".into()))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Slippage factors
    // =========================================================================

    #[test]
    fn test_slippage_non_increasing_and_clamped() {
        assert_eq!(liquidity_factor(1_000_000.0), 1.0);
        assert_eq!(liquidity_factor(600_000.0), 1.2);
        assert_eq!(liquidity_factor(200_000.0), 1.5);
        assert_eq!(liquidity_factor(60_000.0), 2.0);
        assert_eq!(liquidity_factor(10_000.0), 3.0);
        assert!(volatility_factor(0.001) <= volatility_factor(0.1));
        assert!(amount_factor(1_000.0) <= amount_factor(200_000.0));

        let source = RouteSource::Dex(crate::types::DexId::Baseswap);
        let mut last = f64::INFINITY;
        for liq in [10_000.0, 60_000.0, 200_000.0, 600_000.0, 2_000_000.0] {
            let s = estimate_hop_slippage(source, liq, 5_000.0, 0.02);
            assert!(s <= last, "slippage must not increase with liquidity");
            last = s;
        }

        // Deep/calm clamps at the floor, thin/wild at the ceiling
        let uni = RouteSource::Dex(crate::types::DexId::UniswapV3);
        assert!(estimate_hop_slippage(uni, 10_000_000.0, 100.0, 0.0) >= MIN_HOP_SLIPPAGE);
        assert_eq!(estimate_hop_slippage(source, 1_000.0, 500_000.0, 0.5), MAX_HOP_SLIPPAGE);
    }

    #[test]
    fn test_returns_std() {
        // Constant prices and too-short histories read as calm
        assert_eq!(returns_std(&[100.0; 30]), 0.0);
        assert_eq!(returns_std(&[100.0, 101.0]), 0.0);

        // Alternating ±1% moves have a positive, stable std
        let mut prices = vec![100.0];
        for i in 0..30 {
            let last = *prices.last().unwrap();
            prices.push(if i % 2 == 0 { last * 1.01 } else { last / 1.01 });
        }
        let std = returns_std(&prices);
        assert!(std > 0.005 && std < 0.02, "got {std}");
    }

    #[test]
    fn test_breakdown_composition() {
        // The reference triangular numbers, asserted part by part
        let b = compose_breakdown(3.65, 0.30, 1.80, 0.50, 1_825.0, 1.0);
        assert!((b.net_profit_usd - 1.05).abs() < 1e-9);
        assert!(b.meets_threshold);
        assert!((b.net_profit_percent - 1.05 / 1_825.0 * 100.0).abs() < 1e-9);

        // Costs exceeding the edge fail the threshold
        let thin = compose_breakdown(2.0, 1.0, 0.8, 0.5, 1_000.0, 1.0);
        assert!((thin.net_profit_usd - (-0.3)).abs() < 1e-9);
        assert!(!thin.meets_threshold);

        // Degenerate zero-input path reports zero percent
        assert_eq!(compose_breakdown(1.0, 0.1, 0.1, 0.1, 0.0, 1.0).net_profit_percent, 0.0);

        // Modeled gas: (21k + Σ hop gas + 250k flash overhead) × 1.5
        let hop_gas = 3 * 150_000u64;
        let units = (21_000 + hop_gas + FLASH_LOAN_OVERHEAD_GAS) * GAS_BUFFER_NUM / GAS_BUFFER_DEN;
        assert_eq!(units, 1_081_500);
    }
}
