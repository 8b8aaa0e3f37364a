//! Engine configuration: chain knobs, routing sources, statistical and
//! economic thresholds, plus well-known addresses and API endpoints.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// === Well-known endpoints ===

/// OpenOcean aggregator quote API (per-chain path segment appended)
pub const OPENOCEAN_API_BASE: &str = "https://open-api.openocean.finance/v3";

/// Odos aggregator API (quote + assemble)
pub const ODOS_API_BASE: &str = "https://api.odos.xyz";

/// KyberSwap aggregator API (per-chain path segment appended)
pub const KYBER_API_BASE: &str = "https://aggregator-api.kyberswap.com";

/// GeckoTerminal pools listing API (alt-token pair discovery)
pub const POOLS_API_BASE: &str = "https://api.geckoterminal.com/api/v2";

/// CoinGecko-compatible token markets API (price/liquidity refresh)
pub const MARKETS_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// GoPlus-compatible token security API (scam filter)
pub const TOKEN_SECURITY_API_BASE: &str = "https://api.gopluslabs.io/api/v1";

/// Known MEV bot address list fetched at startup
pub const MEV_BLACKLIST_URL: &str =
    "https://raw.githubusercontent.com/mev-refund/known-bots/main/addresses.txt";

// === Defaults (Base mainnet) ===

/// Base mainnet chain id
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// WETH on Base (numeraire: first base token)
pub const BASE_WETH: &str = "0x4200000000000000000000000000000000000006";
/// USDC on Base
pub const BASE_USDC: &str = "0x833589fCB6eDb81B1b3bC2fDa1bd57D8AA69aEc1";
/// cbETH on Base
pub const BASE_CBETH: &str = "0x2Ae3F1Ec7F1F5012CFEab0185bfc7aa3cf0DEc22";

/// Metrics text file refresh cadence (seconds)
pub const METRICS_EXPORT_INTERVAL_SECS: u64 = 30;

/// Gas oracle fee-history sampling cadence (seconds)
pub const GAS_SAMPLE_INTERVAL_SECS: u64 = 15;

/// Z-score engine price sampling cadence per tracked token (seconds)
pub const PRICE_SAMPLE_INTERVAL_SECS: u64 = 30;

/// Transaction confirmation timeout (seconds)
pub const CONFIRMATION_TIMEOUT_SECS: u64 = 60;

/// Graceful-shutdown bound on draining in-flight transactions (seconds)
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// RPC transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    pub max_requests_per_second: u32,
    pub max_requests_per_minute: u32,
    pub request_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub unhealthy_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10,
            max_requests_per_minute: 300,
            request_timeout_ms: 10_000,
            health_check_interval_ms: 5_000,
            unhealthy_timeout_ms: 30_000,
        }
    }
}

/// Z-score / cointegration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreSettings {
    /// Rolling window size for z-score computation
    pub window_size: usize,
    /// |z| above this opens a statistical opportunity
    pub entry_threshold: f64,
    /// |z| below this closes the position signal
    pub exit_threshold: f64,
    /// Lookback length for cointegration testing
    pub lookback: usize,
    /// How many liquidity-ranked alt tokens to pair with the base tokens
    pub top_alt_tokens: usize,
    /// Minimum pool liquidity in USD for an alt pair to qualify
    pub min_alt_liquidity_usd: f64,
}

impl Default for ZScoreSettings {
    fn default() -> Self {
        Self {
            // Ring capacity is 1.5x the window; 400 keeps enough history on
            // hand for the 500-sample cointegration lookback's 80% floor
            window_size: 400,
            entry_threshold: 2.0,
            exit_threshold: 0.5,
            lookback: 500,
            top_alt_tokens: 20,
            min_alt_liquidity_usd: 250_000.0,
        }
    }
}

/// Per-service API budget (requests per minute)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRateLimit {
    pub requests_per_minute: u32,
}

/// Full engine configuration read at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chain_id: u64,
    /// Ordered endpoint URLs; first healthy one also hosts the mempool
    /// subscription (ws:// / wss:// derived from it when possible)
    pub rpc_nodes: Vec<String>,
    pub rpc_settings: RpcSettings,
    /// Flash-loan-eligible assets; the first is the numeraire
    pub base_tokens: Vec<String>,
    /// Direct DEX routing sources, in quote order
    pub monitored_dexes: Vec<String>,
    /// HTTP aggregator priority order
    pub aggregator_priority: Vec<String>,
    /// requests-per-minute budgets keyed by service name
    pub api_rate_limits: Vec<(String, ApiRateLimit)>,
    pub zscore_settings: ZScoreSettings,
    pub max_gas_price_gwei: f64,
    pub min_profit_threshold_usd: f64,
    pub flash_loan_premium_bps: u64,
    /// Maximum path depth for the multi-hop search
    pub max_hops: usize,
    /// Dry-run mode: full pipeline, no broadcast
    pub test_mode: bool,
    /// Consecutive cycle errors before emergency shutdown
    pub max_consecutive_errors: u32,
    /// Metrics text file path
    pub metrics_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            rpc_nodes: vec!["https://mainnet.base.org".to_string()],
            rpc_settings: RpcSettings::default(),
            base_tokens: vec![
                BASE_WETH.to_string(),
                BASE_USDC.to_string(),
                BASE_CBETH.to_string(),
            ],
            monitored_dexes: vec![
                "uniswap_v3".to_string(),
                "sushiswap_v3".to_string(),
                "aerodrome".to_string(),
                "baseswap".to_string(),
            ],
            aggregator_priority: vec![
                "openocean".to_string(),
                "odos".to_string(),
                "kyberswap".to_string(),
            ],
            api_rate_limits: vec![
                ("openocean".to_string(), ApiRateLimit { requests_per_minute: 60 }),
                ("odos".to_string(), ApiRateLimit { requests_per_minute: 60 }),
                ("kyberswap".to_string(), ApiRateLimit { requests_per_minute: 120 }),
                ("pools".to_string(), ApiRateLimit { requests_per_minute: 30 }),
                ("markets".to_string(), ApiRateLimit { requests_per_minute: 30 }),
                ("token_security".to_string(), ApiRateLimit { requests_per_minute: 30 }),
            ],
            zscore_settings: ZScoreSettings::default(),
            max_gas_price_gwei: 5.0,
            min_profit_threshold_usd: 1.0,
            flash_loan_premium_bps: 5,
            max_hops: 6,
            test_mode: true,
            max_consecutive_errors: 10,
            metrics_path: "./metrics.prom".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<u64>("CHAIN_ID") {
            cfg.chain_id = v;
        }
        if let Ok(v) = std::env::var("RPC_NODES") {
            let nodes: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !nodes.is_empty() {
                cfg.rpc_nodes = nodes;
            }
        }
        if let Some(v) = env_parse::<f64>("MAX_GAS_PRICE_GWEI") {
            cfg.max_gas_price_gwei = v;
        }
        if let Some(v) = env_parse::<f64>("MIN_PROFIT_THRESHOLD_USD") {
            cfg.min_profit_threshold_usd = v;
        }
        if let Some(v) = env_parse::<u64>("FLASH_LOAN_PREMIUM_BPS") {
            cfg.flash_loan_premium_bps = v;
        }
        if let Ok(v) = std::env::var("TEST_MODE") {
            cfg.test_mode = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("METRICS_PATH") {
            cfg.metrics_path = v;
        }
        if let Some(v) = env_parse::<f64>("ZSCORE_ENTRY_THRESHOLD") {
            cfg.zscore_settings.entry_threshold = v;
        }

        cfg
    }

    /// Collect every configuration problem; the orchestrator refuses to
    /// leave `Initializing` on any.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors = Vec::new();

        if self.rpc_nodes.is_empty() {
            errors.push("rpc_nodes: at least one endpoint required".to_string());
        }
        for url in &self.rpc_nodes {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("rpc_nodes: invalid URL {url}"));
            }
        }
        if self.base_tokens.is_empty() {
            errors.push("base_tokens: at least one flash-loan asset required".to_string());
        }
        for addr in &self.base_tokens {
            if addr.len() != 42 || !addr.starts_with("0x") {
                errors.push(format!("base_tokens: invalid address {addr}"));
            }
        }
        if self.monitored_dexes.is_empty() && self.aggregator_priority.is_empty() {
            errors.push("no routing sources configured".to_string());
        }
        if self.max_gas_price_gwei <= 0.0 {
            errors.push("max_gas_price_gwei must be positive".to_string());
        }
        if self.min_profit_threshold_usd < 0.0 {
            errors.push("min_profit_threshold_usd must be non-negative".to_string());
        }
        if self.zscore_settings.entry_threshold <= self.zscore_settings.exit_threshold {
            errors.push("zscore: entry_threshold must exceed exit_threshold".to_string());
        }
        if self.zscore_settings.window_size < 10 {
            errors.push("zscore: window_size must be at least 10".to_string());
        }
        if self.max_hops < 2 {
            errors.push("max_hops must be at least 2 (closed cycle)".to_string());
        }
        if self.rpc_settings.max_requests_per_second == 0
            || self.rpc_settings.max_requests_per_minute == 0
        {
            errors.push("rpc_settings: request budgets must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigInvalid(errors))
        }
    }

    /// Per-minute budget for a named service; None if not configured.
    pub fn rate_limit_for(&self, service: &str) -> Option<u32> {
        self.api_rate_limits
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, l)| l.requests_per_minute)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_collects_all_errors() {
        let defaults = Config::default();
        assert!(defaults.validate().is_ok());
        assert_eq!(defaults.rate_limit_for("odos"), Some(60));
        assert_eq!(defaults.rate_limit_for("unknown"), None);

        let cfg = Config {
            rpc_nodes: vec![],
            base_tokens: vec!["not-an-address".to_string()],
            max_gas_price_gwei: 0.0,
            ..Config::default()
        };

        match cfg.validate() {
            Err(EngineError::ConfigInvalid(errors)) => {
                assert!(errors.len() >= 3, "expected all problems reported, got {errors:?}");
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }

        let mut inverted = Config::default();
        inverted.zscore_settings.entry_threshold = 0.4;
        inverted.zscore_settings.exit_threshold = 0.5;
        assert!(inverted.validate().is_err());
    }
}
