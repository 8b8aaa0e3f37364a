//! Core type definitions for the arbitrage engine.
//!
//! This module provides the data model shared across components: tokens and
//! pairs, routing sources, hops and opportunities, and the exact-integer /
//! display-float conversion helpers.

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::format_units;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on the raw-unit output/input ratio of a single hop. Covers
/// an 18-to-6 decimal drop combined with extreme price ratios; anything
/// above it is a corrupt quote.
pub const MAX_PLAUSIBLE_RATE: u64 = 1_000_000_000_000_000_000;

/// Minimum believable quote output in smallest units.
pub const MIN_QUOTE_RETURN: u64 = 100;

// === Tokens ===

/// A known token. Price and liquidity are display values refreshed
/// periodically; on-chain amounts never derive from them except for
/// notional sizing.
#[derive(Debug, Clone)]
pub struct Token {
    pub address: Address,
    pub symbol: Arc<str>,
    pub decimals: u8,
    pub is_stable: bool,
    /// Flash-loan-eligible asset from config
    pub is_base: bool,
    pub price_usd: f64,
    /// Aggregate liquidity across tracked pools, USD
    pub liquidity_usd: f64,
}

impl Token {
    pub fn new(address: Address, symbol: &str, decimals: u8) -> Self {
        Self {
            address,
            symbol: symbol.into(),
            decimals,
            is_stable: false,
            is_base: false,
            price_usd: 0.0,
            liquidity_usd: 0.0,
        }
    }
}

/// Pair kind drives cointegration re-test cadence and trade sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairKind {
    BaseBase,
    BaseAlt,
}

/// An ordered token pair tracked by the statistical engine.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub token_a: Address,
    pub token_b: Address,
    pub kind: PairKind,
}

impl TokenPair {
    pub fn new(token_a: Address, token_b: Address, kind: PairKind) -> Self {
        Self { token_a, token_b, kind }
    }

    /// Stable cache key.
    pub fn key(&self) -> (Address, Address) {
        (self.token_a, self.token_b)
    }
}

/// Cointegration attributes attached to a tested pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct CointegrationStats {
    pub cointegrated: bool,
    pub half_life: f64,
    pub hurst_exponent: f64,
    pub slope: f64,
    pub intercept: f64,
    pub adf_statistic: f64,
    pub r_squared: f64,
}

/// One oracle price observation.
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub price_usd: f64,
    pub timestamp: i64,
}

// === Routing sources ===

/// HTTP quote/route providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregatorId {
    OpenOcean,
    Odos,
    Kyber,
}

impl AggregatorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregatorId::OpenOcean => "openocean",
            AggregatorId::Odos => "odos",
            AggregatorId::Kyber => "kyberswap",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "openocean" => Some(AggregatorId::OpenOcean),
            "odos" => Some(AggregatorId::Odos),
            "kyberswap" | "kyber" => Some(AggregatorId::Kyber),
            _ => None,
        }
    }
}

/// Direct DEX routers quoted on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DexId {
    UniswapV3,
    SushiswapV3,
    Aerodrome,
    Baseswap,
}

impl DexId {
    pub fn as_str(&self) -> &'static str {
        match self {
            DexId::UniswapV3 => "uniswap_v3",
            DexId::SushiswapV3 => "sushiswap_v3",
            DexId::Aerodrome => "aerodrome",
            DexId::Baseswap => "baseswap",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uniswap_v3" => Some(DexId::UniswapV3),
            "sushiswap_v3" => Some(DexId::SushiswapV3),
            "aerodrome" => Some(DexId::Aerodrome),
            "baseswap" => Some(DexId::Baseswap),
            _ => None,
        }
    }

    /// Concentrated-liquidity routers iterate fee tiers; V2 forks do not.
    pub fn is_v3(&self) -> bool {
        matches!(self, DexId::UniswapV3 | DexId::SushiswapV3)
    }
}

/// A routing source: closed variant set, one handler per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteSource {
    Aggregator(AggregatorId),
    Dex(DexId),
}

impl RouteSource {
    pub fn name(&self) -> &'static str {
        match self {
            RouteSource::Aggregator(a) => a.as_str(),
            RouteSource::Dex(d) => d.as_str(),
        }
    }

    /// Per-source base slippage fraction used as the default when building
    /// hop minimums and as the slippage model's base term.
    pub fn base_slippage(&self) -> f64 {
        match self {
            RouteSource::Aggregator(AggregatorId::OpenOcean) => 0.0010,
            RouteSource::Aggregator(AggregatorId::Odos) => 0.0008,
            RouteSource::Aggregator(AggregatorId::Kyber) => 0.0010,
            RouteSource::Dex(DexId::UniswapV3) => 0.0005,
            RouteSource::Dex(DexId::SushiswapV3) => 0.0015,
            RouteSource::Dex(DexId::Aerodrome) => 0.0020,
            RouteSource::Dex(DexId::Baseswap) => 0.0030,
        }
    }
}

impl std::fmt::Display for RouteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// === Quotes ===

/// One leg inside a provider route.
#[derive(Debug, Clone)]
pub struct QuoteHop {
    pub from_token: Address,
    pub to_token: Address,
    /// Pool or venue label as reported by the provider
    pub venue: Arc<str>,
}

/// Uniform quote across every routing source.
#[derive(Debug, Clone)]
pub struct RouteQuote {
    pub source: RouteSource,
    pub return_amount: U256,
    pub hops: Vec<QuoteHop>,
    pub gas_estimate: u64,
    /// Fraction, e.g. 0.003 = 0.3%
    pub price_impact: f64,
    /// Opaque payload the on-chain executor forwards to the source router.
    /// For Odos this is only populated after the assemble step.
    pub provider_payload: Bytes,
}

impl RouteQuote {
    /// Believable output, at least one leg, positive gas.
    pub fn is_valid(&self) -> bool {
        self.return_amount >= U256::from(MIN_QUOTE_RETURN)
            && !self.hops.is_empty()
            && self.gas_estimate > 0
    }
}

// === Opportunities ===

/// One token→token swap inside a path. Immutable once created.
#[derive(Debug, Clone)]
pub struct Hop {
    pub from_token: Address,
    pub to_token: Address,
    pub amount_in: U256,
    pub min_amount_out: U256,
    pub source: RouteSource,
    pub payload: Bytes,
    pub gas_estimate: u64,
    pub price_impact: f64,
}

impl Hop {
    /// Hop-level invariants: positive input, plausible minimum.
    pub fn is_valid(&self) -> bool {
        if self.amount_in.is_zero() {
            return false;
        }
        match self.amount_in.checked_mul(U256::from(MAX_PLAUSIBLE_RATE)) {
            Some(cap) => self.min_amount_out <= cap,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityKind {
    Statistical,
    Triangular,
    MultiHop,
}

impl std::fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpportunityKind::Statistical => write!(f, "statistical"),
            OpportunityKind::Triangular => write!(f, "triangular"),
            OpportunityKind::MultiHop => write!(f, "multi-hop"),
        }
    }
}

/// Z-score context attached to statistical opportunities.
#[derive(Debug, Clone, Copy)]
pub struct ZScoreSnapshot {
    pub zscore: f64,
    pub confidence: f64,
    pub half_life: f64,
    pub hurst_exponent: f64,
}

/// A candidate arbitrage: a closed cycle of hops starting and ending at the
/// flash-loan asset. Created by the scanner, annotated by the accountant,
/// consumed or discarded within the cycle.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: u64,
    pub kind: OpportunityKind,
    pub hops: Vec<Hop>,
    pub amount_in: U256,
    pub expected_out: U256,
    /// Raw edge before costs, percent of input
    pub gross_profit_percent: f64,
    /// Unix seconds; rejected at execution if in the past
    pub deadline: i64,
    pub zscore: Option<ZScoreSnapshot>,
    /// Scanner ranking score
    pub score: f64,
    /// Sum of per-hop pool liquidity, USD (for ranking and slippage)
    pub path_liquidity_usd: f64,
}

impl Opportunity {
    /// Flash-loan asset: the first hop's input token.
    pub fn flash_asset(&self) -> Option<Address> {
        self.hops.first().map(|h| h.from_token)
    }

    /// Shape validation per the data-model invariants. Returns the first
    /// violation as a human-readable reason.
    pub fn validate_shape(&self, now: i64) -> Result<(), String> {
        if self.hops.is_empty() {
            return Err("empty hop list".to_string());
        }
        let first = &self.hops[0];
        let last = &self.hops[self.hops.len() - 1];
        if first.from_token != last.to_token {
            return Err("path is not a closed cycle".to_string());
        }
        if self.amount_in.is_zero() {
            return Err("zero input amount".to_string());
        }
        for (i, hop) in self.hops.iter().enumerate() {
            if !hop.is_valid() {
                return Err(format!("hop {i} fails amount invariants"));
            }
            if i > 0 && self.hops[i - 1].to_token != hop.from_token {
                return Err(format!("hop {i} does not continue the path"));
            }
        }
        if self.deadline <= now {
            return Err("deadline elapsed".to_string());
        }
        Ok(())
    }

    /// Sum of per-hop price impact, for ranking and MEV heuristics.
    pub fn total_price_impact(&self) -> f64 {
        self.hops.iter().map(|h| h.price_impact).sum()
    }

    /// Sum of per-hop gas estimates, excluding flash-loan overhead.
    pub fn total_hop_gas(&self) -> u64 {
        self.hops.iter().map(|h| h.gas_estimate).sum()
    }
}

// === Pending transactions ===

/// A broadcast transaction awaiting its receipt.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub tx_hash: H256,
    pub nonce: u64,
    pub raw: Bytes,
    pub opportunity_id: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub submitted_at: Instant,
}

// === Conversions ===

/// Exact integer amount → display float in whole tokens. Display only;
/// never fed back into on-chain amounts.
pub fn amount_to_f64(amount: U256, decimals: u8) -> f64 {
    format_units(amount, decimals as u32)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Display value of an exact amount at a USD price.
pub fn amount_to_usd(amount: U256, decimals: u8, price_usd: f64) -> f64 {
    amount_to_f64(amount, decimals) * price_usd
}

/// Notional sizing: whole-token float → smallest units. Used only when
/// choosing a flash-loan principal from a USD cap.
pub fn amount_from_f64(value: f64, decimals: u8) -> U256 {
    if value <= 0.0 || !value.is_finite() {
        return U256::zero();
    }
    let scaled = value * 10f64.powi(decimals as i32);
    if scaled >= u128::MAX as f64 {
        return U256::from(u128::MAX);
    }
    U256::from(scaled as u128)
}

/// Apply a slippage fraction to an exact amount: `amount * (1 - slippage)`,
/// computed in integer basis points.
pub fn apply_slippage(amount: U256, slippage: f64) -> U256 {
    let bps = (slippage.clamp(0.0, 1.0) * 10_000.0).round() as u64;
    amount * U256::from(10_000 - bps.min(10_000)) / U256::from(10_000)
}

/// Gwei display value of an exact wei amount.
pub fn wei_to_gwei(wei: U256) -> f64 {
    amount_to_f64(wei, 9)
}

/// Exact wei from a gwei display value (for config ceilings).
pub fn gwei_to_wei(gwei: f64) -> U256 {
    amount_from_f64(gwei, 9)
}

// =============================================================================
// TESTS
// =============================================================================

/// Builders shared by module tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    pub(crate) fn test_hop(from: u8, to: u8, amount_in: u64) -> Hop {
        Hop {
            from_token: addr(from),
            to_token: addr(to),
            amount_in: U256::from(amount_in),
            min_amount_out: U256::from(amount_in),
            source: RouteSource::Dex(DexId::UniswapV3),
            payload: Bytes::new(),
            gas_estimate: 150_000,
            price_impact: 0.001,
        }
    }

    /// Three-hop closed cycle on tokens 1→2→3→1.
    pub(crate) fn cycle_opportunity() -> Opportunity {
        Opportunity {
            id: 1,
            kind: OpportunityKind::Triangular,
            hops: vec![
                test_hop(1, 2, 1_000_000),
                test_hop(2, 3, 2_000_000),
                test_hop(3, 1, 990_000),
            ],
            amount_in: U256::from(1_000_000u64),
            expected_out: U256::from(1_002_000u64),
            gross_profit_percent: 0.2,
            deadline: i64::MAX,
            zscore: None,
            score: 0.0,
            path_liquidity_usd: 1_000_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    // =========================================================================
    // Opportunity shape validation
    // =========================================================================

    #[test]
    fn test_shape_validation() {
        let op = cycle_opportunity();
        assert!(op.validate_shape(0).is_ok());
        assert_eq!(op.hops[0].from_token, op.hops[op.hops.len() - 1].to_token);
        assert_eq!(op.flash_asset(), Some(addr(1)));
        assert_eq!(op.total_hop_gas(), 450_000);
        assert!((op.total_price_impact() - 0.003).abs() < 1e-12);

        let mut empty = cycle_opportunity();
        empty.hops.clear();
        assert_eq!(empty.validate_shape(0), Err("empty hop list".to_string()));

        let mut open = cycle_opportunity();
        open.hops.last_mut().unwrap().to_token = addr(9);
        assert!(open.validate_shape(0).unwrap_err().contains("closed cycle"));

        let mut torn = cycle_opportunity();
        torn.hops[1].from_token = addr(7);
        assert!(torn.validate_shape(0).unwrap_err().contains("continue"));

        let mut zeroed = cycle_opportunity();
        zeroed.hops[0].amount_in = U256::zero();
        assert!(zeroed.validate_shape(0).is_err());

        let mut expired = cycle_opportunity();
        expired.deadline = 100;
        assert!(expired.validate_shape(100).is_err());
        assert!(expired.validate_shape(99).is_ok());

        // Hop minimums above any plausible rate are corrupt quotes
        let mut h = test_hop(1, 2, 10);
        h.min_amount_out = U256::from(10u64) * U256::from(MAX_PLAUSIBLE_RATE) + U256::one();
        assert!(!h.is_valid());
        h.min_amount_out = U256::from(10u64) * U256::from(MAX_PLAUSIBLE_RATE);
        assert!(h.is_valid());
    }

    #[test]
    fn test_quote_validation() {
        let quote = RouteQuote {
            source: RouteSource::Aggregator(AggregatorId::Odos),
            return_amount: U256::from(1000u64),
            hops: vec![QuoteHop {
                from_token: addr(1),
                to_token: addr(2),
                venue: "pool".into(),
            }],
            gas_estimate: 180_000,
            price_impact: 0.001,
            provider_payload: Bytes::new(),
        };
        assert!(quote.is_valid());

        // Dust output, empty route, or free gas all fail validation
        let mut dust = quote.clone();
        dust.return_amount = U256::from(99u64);
        assert!(!dust.is_valid());
        let mut empty = quote.clone();
        empty.hops.clear();
        assert!(!empty.is_valid());
        let mut free = quote;
        free.gas_estimate = 0;
        assert!(!free.is_valid());
    }

    #[test]
    fn test_conversions() {
        assert!((amount_to_f64(U256::exp10(18), 18) - 1.0).abs() < 1e-12);
        assert!((amount_to_f64(U256::from(2_500_000u64), 6) - 2.5).abs() < 1e-12);
        assert!((amount_to_usd(U256::exp10(18) / 2, 18, 1800.0) - 900.0).abs() < 1e-6);

        assert_eq!(amount_from_f64(1.0, 6), U256::from(1_000_000u64));
        assert_eq!(amount_from_f64(0.0, 18), U256::zero());
        assert_eq!(amount_from_f64(-5.0, 18), U256::zero());
        assert_eq!(amount_from_f64(f64::NAN, 18), U256::zero());

        let amount = U256::from(10_000u64);
        assert_eq!(apply_slippage(amount, 0.01), U256::from(9_900u64));
        assert_eq!(apply_slippage(amount, 0.0), amount);
        assert_eq!(apply_slippage(amount, 1.0), U256::zero());

        let wei = gwei_to_wei(1.5);
        assert_eq!(wei, U256::from(1_500_000_000u64));
        assert!((wei_to_gwei(wei) - 1.5).abs() < 1e-12);

        // Source names round-trip through config strings
        for id in [AggregatorId::OpenOcean, AggregatorId::Odos, AggregatorId::Kyber] {
            assert_eq!(AggregatorId::from_name(id.as_str()), Some(id));
        }
        for id in [DexId::UniswapV3, DexId::SushiswapV3, DexId::Aerodrome, DexId::Baseswap] {
            assert_eq!(DexId::from_name(id.as_str()), Some(id));
        }
        assert_eq!(AggregatorId::from_name("1inch"), None);
    }
}
