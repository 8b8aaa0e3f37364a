//! Token catalog with price/liquidity refresh and a scam filter.
//!
//! Tokens are discovered at init (config base tokens) and during pair
//! discovery; they are refreshed periodically and never destroyed within a
//! session. The scam filter consults a token-security API once per address
//! and caches the verdict for the process lifetime.

use ethers::contract::abigen;
use ethers::types::Address;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{Config, MARKETS_API_BASE, TOKEN_SECURITY_API_BASE};
use crate::error::EngineError;
use crate::rate_limit::ApiRateLimiters;
use crate::rpc::RpcPool;
use crate::types::Token;

abigen!(
    IErc20Metadata,
    r#"[
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
    ]"#
);

/// Buy/sell tax above this fraction fails the scam filter.
const MAX_TOKEN_TAX: f64 = 0.10;

/// Price refresh cadence.
const REFRESH_INTERVAL_SECS: u64 = 60;

/// Seed metadata for the Base-mainnet default assets, so init does not need
/// chain reads for them.
const KNOWN_TOKENS: &[(&str, &str, u8, bool)] = &[
    ("0x4200000000000000000000000000000000000006", "WETH", 18, false),
    ("0x833589fCB6eDb81B1b3bC2fDa1bd57D8AA69aEc1", "USDC", 6, true),
    ("0x2Ae3F1Ec7F1F5012CFEab0185bfc7aa3cf0DEc22", "cbETH", 18, false),
];

#[derive(Debug, Deserialize)]
struct TokenPriceEntry {
    usd: Option<f64>,
}

/// Token-security API entry (GoPlus-compatible shape). String-encoded flags
/// as delivered by the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityInfo {
    #[serde(default)]
    pub is_honeypot: Option<String>,
    #[serde(default)]
    pub is_open_source: Option<String>,
    #[serde(default)]
    pub buy_tax: Option<String>,
    #[serde(default)]
    pub sell_tax: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecurityResponse {
    #[serde(default)]
    result: HashMap<String, SecurityInfo>,
}

/// Verdict of the scam filter over a security report. Unknown fields count
/// against the token.
pub fn is_token_safe(info: &SecurityInfo) -> bool {
    if info.is_honeypot.as_deref() == Some("1") {
        return false;
    }
    if info.is_open_source.as_deref() == Some("0") {
        return false;
    }
    let tax_ok = |tax: &Option<String>| {
        tax.as_deref()
            .and_then(|t| t.parse::<f64>().ok())
            .map(|t| t <= MAX_TOKEN_TAX)
            .unwrap_or(true)
    };
    tax_ok(&info.buy_tax) && tax_ok(&info.sell_tax)
}

/// Catalog of known tokens.
pub struct TokenRegistry {
    chain_id: u64,
    tokens: RwLock<FxHashMap<Address, Token>>,
    /// Process-lifetime scam verdicts
    security: RwLock<FxHashMap<Address, bool>>,
    http: reqwest::Client,
    limiters: Arc<ApiRateLimiters>,
}

impl TokenRegistry {
    pub fn new(config: &Config, limiters: Arc<ApiRateLimiters>) -> Self {
        Self {
            chain_id: config.chain_id,
            tokens: RwLock::new(FxHashMap::default()),
            security: RwLock::new(FxHashMap::default()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build HTTP client"),
            limiters,
        }
    }

    /// Seed config base tokens. Base assets are exempt from the scam filter.
    pub async fn seed_base_tokens(&self, config: &Config) -> Result<(), EngineError> {
        let mut tokens = self.tokens.write().await;
        for addr_str in &config.base_tokens {
            let address: Address = addr_str
                .parse()
                .map_err(|_| EngineError::ConfigInvalid(vec![format!("bad token {addr_str}")]))?;
            let known = KNOWN_TOKENS
                .iter()
                .find(|(a, _, _, _)| a.eq_ignore_ascii_case(addr_str));
            let mut token = match known {
                Some((_, symbol, decimals, is_stable)) => {
                    let mut t = Token::new(address, symbol, *decimals);
                    t.is_stable = *is_stable;
                    t
                }
                None => Token::new(address, "BASE", 18),
            };
            token.is_base = true;
            tokens.insert(address, token);
        }
        info!("[REGISTRY] seeded {} base tokens", tokens.len());
        Ok(())
    }

    pub async fn get(&self, address: Address) -> Option<Token> {
        self.tokens.read().await.get(&address).cloned()
    }

    pub async fn price_usd(&self, address: Address) -> Option<f64> {
        self.tokens
            .read()
            .await
            .get(&address)
            .map(|t| t.price_usd)
            .filter(|p| *p > 0.0)
    }

    pub async fn liquidity_usd(&self, address: Address) -> f64 {
        self.tokens
            .read()
            .await
            .get(&address)
            .map(|t| t.liquidity_usd)
            .unwrap_or(0.0)
    }

    pub async fn decimals(&self, address: Address) -> Option<u8> {
        self.tokens.read().await.get(&address).map(|t| t.decimals)
    }

    pub async fn base_tokens(&self) -> Vec<Token> {
        self.tokens
            .read()
            .await
            .values()
            .filter(|t| t.is_base)
            .cloned()
            .collect()
    }

    pub async fn upsert(&self, token: Token) {
        self.tokens.write().await.insert(token.address, token);
    }

    /// Price/liquidity update preserving discovery metadata.
    pub async fn update_market_data(&self, address: Address, price_usd: f64, liquidity_usd: f64) {
        let mut tokens = self.tokens.write().await;
        if let Some(token) = tokens.get_mut(&address) {
            if price_usd > 0.0 {
                token.price_usd = price_usd;
            }
            if liquidity_usd > 0.0 {
                token.liquidity_usd = liquidity_usd;
            }
        }
    }

    /// Tokens ranked by aggregate liquidity, highest first.
    pub async fn top_by_liquidity(&self, n: usize) -> Vec<Token> {
        let mut all: Vec<Token> = self.tokens.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.liquidity_usd
                .partial_cmp(&a.liquidity_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(n);
        all
    }

    /// Resolve symbol/decimals on-chain and register the token. Non-base
    /// tokens must pass the scam filter first.
    pub async fn discover_token(
        &self,
        pool: &RpcPool,
        address: Address,
    ) -> Result<Token, EngineError> {
        if let Some(existing) = self.get(address).await {
            return Ok(existing);
        }
        if !self.check_token_security(address).await? {
            return Err(EngineError::QuoteUnavailable(format!(
                "token {address:?} failed security screen"
            )));
        }

        let (symbol, decimals) = pool
            .execute(|provider| async move {
                let erc20 = IErc20Metadata::new(address, provider);
                let decimals = erc20.decimals().call().await.map_err(contract_to_provider_err)?;
                let symbol = erc20
                    .symbol()
                    .call()
                    .await
                    .unwrap_or_else(|_| "UNKNOWN".to_string());
                Ok((symbol, decimals))
            })
            .await?;

        let token = Token::new(address, &symbol, decimals);
        self.upsert(token.clone()).await;
        debug!("[REGISTRY] discovered {} ({address:?})", token.symbol);
        Ok(token)
    }

    /// Scam filter with process-lifetime caching. Base tokens short-circuit
    /// safe; API failures fail open with a warning so a flaky screen never
    /// blocks the whole universe.
    pub async fn check_token_security(&self, address: Address) -> Result<bool, EngineError> {
        if let Some(token) = self.get(address).await {
            if token.is_base {
                return Ok(true);
            }
        }
        if let Some(cached) = self.security.read().await.get(&address) {
            return Ok(*cached);
        }

        self.limiters.acquire("token_security").await;
        let url = format!(
            "{TOKEN_SECURITY_API_BASE}/token_security/{}?contract_addresses={:#x}",
            self.chain_id, address
        );
        let verdict = match self.fetch_security(&url, address).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[REGISTRY] security screen unavailable for {address:?}: {e}");
                true
            }
        };
        self.security.write().await.insert(address, verdict);
        if !verdict {
            warn!("[REGISTRY] token {address:?} rejected by scam filter");
        }
        Ok(verdict)
    }

    async fn fetch_security(&self, url: &str, address: Address) -> Result<bool, EngineError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::TransportUnavailable(format!(
                "token security API: {}",
                resp.status()
            )));
        }
        let body: SecurityResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("token security schema: {e}")))?;
        let key = format!("{address:#x}");
        let info = body
            .result
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        Ok(is_token_safe(&info))
    }

    /// Refresh USD prices for every known token from the markets API.
    pub async fn refresh_prices(&self) -> Result<usize, EngineError> {
        let addresses: Vec<Address> = self.tokens.read().await.keys().copied().collect();
        if addresses.is_empty() {
            return Ok(0);
        }

        self.limiters.acquire("markets").await;
        let joined = addresses
            .iter()
            .map(|a| format!("{a:#x}"))
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{MARKETS_API_BASE}/simple/token_price/base?contract_addresses={joined}&vs_currencies=usd"
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::TransportUnavailable(format!(
                "markets API: {}",
                resp.status()
            )));
        }
        let body: HashMap<String, TokenPriceEntry> = resp
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("markets schema: {e}")))?;

        let mut updated = 0;
        let mut tokens = self.tokens.write().await;
        for (addr_str, entry) in body {
            let Ok(address) = addr_str.parse::<Address>() else {
                continue;
            };
            let Some(price) = entry.usd.filter(|p| *p > 0.0) else {
                continue;
            };
            if let Some(token) = tokens.get_mut(&address) {
                token.price_usd = price;
                updated += 1;
            }
        }
        Ok(updated)
    }

}

fn contract_to_provider_err<M: std::fmt::Display>(
    e: M,
) -> ethers::providers::ProviderError {
    ethers::providers::ProviderError::CustomError(e.to_string())
}

/// Price-history refresher: re-prices the catalog every minute.
pub async fn run_registry_refresh_loop(registry: Arc<TokenRegistry>) {
    info!("[REGISTRY] refresh loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
    loop {
        interval.tick().await;
        match registry.refresh_prices().await {
            Ok(n) => debug!("[REGISTRY] refreshed {n} token prices"),
            Err(e) => warn!("[REGISTRY] price refresh failed: {e}"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
