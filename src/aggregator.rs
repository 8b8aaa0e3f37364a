//! Uniform quoting across HTTP aggregators and direct DEX routers.
//!
//! Sources are a closed variant set: three HTTP providers (OpenOcean, Odos,
//! KyberSwap) and four on-chain routers (Uniswap V3, SushiSwap V3,
//! Aerodrome, BaseSwap). Every source resolves to one `RouteQuote` shape;
//! failures are source-level and recovery means trying the next source.

use ethers::contract::abigen;
use ethers::types::{Address, Bytes, U256};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{Config, KYBER_API_BASE, ODOS_API_BASE, OPENOCEAN_API_BASE};
use crate::error::EngineError;
use crate::rate_limit::ApiRateLimiters;
use crate::rpc::RpcPool;
use crate::types::{AggregatorId, DexId, QuoteHop, RouteQuote, RouteSource};

/// Quote cache TTL.
const QUOTE_TTL: Duration = Duration::from_secs(5);

/// Chain path segment used by the per-chain provider APIs.
const CHAIN_SLUG: &str = "base";

/// V3 fee tiers in quote order.
const V3_FEE_TIERS: [u32; 4] = [500, 3_000, 10_000, 100];

/// Default gas estimates for direct router swaps.
const V3_SWAP_GAS: u64 = 160_000;
const V2_SWAP_GAS: u64 = 120_000;

abigen!(
    IUniswapV3Factory,
    r#"[
        function getPool(address tokenA, address tokenB, uint24 fee) external view returns (address pool)
    ]"#
);

abigen!(
    IUniswapV3Pool,
    r#"[
        function liquidity() external view returns (uint128)
        function slot0() external view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked)
    ]"#
);

// QuoterV1 signature; not a view (reverts internally after computing), so
// only ever .call() it.
abigen!(
    IQuoter,
    r#"[
        function quoteExactInputSingle(address tokenIn, address tokenOut, uint24 fee, uint256 amountIn, uint160 sqrtPriceLimitX96) external returns (uint256 amountOut)
    ]"#
);

abigen!(
    IV2Router,
    r#"[
        function getAmountsOut(uint256 amountIn, address[] calldata path) external view returns (uint256[] memory amounts)
    ]"#
);

// Aerodrome routes carry (from, to, stable, factory) tuples
abigen!(
    IAerodromeRouter,
    r#"[{"inputs":[{"internalType":"uint256","name":"amountIn","type":"uint256"},{"components":[{"internalType":"address","name":"from","type":"address"},{"internalType":"address","name":"to","type":"address"},{"internalType":"bool","name":"stable","type":"bool"},{"internalType":"address","name":"factory","type":"address"}],"internalType":"struct IRouter.Route[]","name":"routes","type":"tuple[]"}],"name":"getAmountsOut","outputs":[{"internalType":"uint256[]","name":"amounts","type":"uint256[]"}],"stateMutability":"view","type":"function"}]"#
);

/// Router/factory/quoter addresses per direct DEX (Base mainnet).
#[derive(Debug, Clone, Copy)]
pub struct DexAddresses {
    pub router: Address,
    pub factory: Address,
    pub quoter: Address,
}

fn parse_addr(s: &str) -> Address {
    s.parse().expect("well-known address")
}

pub fn dex_addresses(dex: DexId) -> DexAddresses {
    // (router, factory, quoter); V2 forks have no quoter
    let (router, factory, quoter) = match dex {
        DexId::UniswapV3 => (
            "0x2626664c2603336E57B271c5C0b26F421741e481",
            "0x33128a8fC17869897dcE68Ed026d694621f6FDfD",
            "0x3d4e44Eb1374240CE5F1B871ab261CD16335B76a",
        ),
        DexId::SushiswapV3 => (
            "0xFB7eF66a7e61224DD6FcD0D7d9C3be5C8B049b9f",
            "0xc35DADB65012eC5796536bD9864eD8773aBc74C4",
            "0xb1E835Dc2785b52265711e17fCCb0fd018226a6e",
        ),
        DexId::Aerodrome => (
            "0xcF77a3Ba9A5CA399B7c97c74d54e5b1Beb874E43",
            "0x420DD381b31aEf6683db6B902084cB0FFECe40Da",
            "",
        ),
        DexId::Baseswap => (
            "0x327Df1E6de05895d2ab08513aaDD9313Fe505d86",
            "0xFDa619b6d20975be80A10332cD39b9a4b0FAa8BB",
            "",
        ),
    };
    DexAddresses {
        router: parse_addr(router),
        factory: parse_addr(factory),
        quoter: if quoter.is_empty() { Address::zero() } else { parse_addr(quoter) },
    }
}

/// On-chain router the executor contract forwards a hop's payload to.
pub fn source_router(source: RouteSource) -> Address {
    match source {
        RouteSource::Dex(dex) => dex_addresses(dex).router,
        RouteSource::Aggregator(AggregatorId::OpenOcean) => {
            parse_addr("0x6352a56caadC4F1E25CD6c75970Fa768A3304e64")
        }
        RouteSource::Aggregator(AggregatorId::Odos) => {
            parse_addr("0x19cEeAd7105607Cd444F5ad10dd51356436095a1")
        }
        RouteSource::Aggregator(AggregatorId::Kyber) => {
            parse_addr("0x6131B5fae19EA4f9D964eAc0408E4408b66337b5")
        }
    }
}

/// Per-quote options; defaults suit scanning (no callable payload needed).
#[derive(Debug, Clone, Copy)]
pub struct QuoteOptions {
    /// Slippage fraction forwarded to HTTP providers
    pub slippage: f64,
    /// Recipient for assembled payloads
    pub recipient: Address,
    /// Ask providers with an assemble step for a callable payload
    pub assemble: bool,
}

impl Default for QuoteOptions {
    fn default() -> Self {
        Self {
            slippage: 0.005,
            recipient: Address::zero(),
            assemble: false,
        }
    }
}

// === Provider response shapes ===

#[derive(Debug, Deserialize)]
struct OpenOceanResponse {
    code: Option<i64>,
    data: Option<OpenOceanData>,
}

#[derive(Debug, Deserialize)]
struct OpenOceanData {
    #[serde(rename = "outAmount")]
    out_amount: Option<String>,
    #[serde(rename = "estimatedGas", default)]
    estimated_gas: Option<serde_json::Value>,
    #[serde(rename = "price_impact", default)]
    price_impact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OdosQuoteResponse {
    #[serde(rename = "outAmounts", default)]
    out_amounts: Vec<String>,
    #[serde(rename = "gasEstimate", default)]
    gas_estimate: Option<f64>,
    #[serde(rename = "priceImpact", default)]
    price_impact: Option<f64>,
    #[serde(rename = "pathId", default)]
    path_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OdosAssembleResponse {
    transaction: Option<OdosTransaction>,
}

#[derive(Debug, Deserialize)]
struct OdosTransaction {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KyberResponse {
    data: Option<KyberData>,
}

#[derive(Debug, Deserialize)]
struct KyberData {
    #[serde(rename = "routeSummary")]
    route_summary: Option<KyberRouteSummary>,
}

#[derive(Debug, Deserialize)]
struct KyberRouteSummary {
    #[serde(rename = "amountOut")]
    amount_out: Option<String>,
    #[serde(default)]
    gas: Option<String>,
}

struct CachedQuote {
    at: Instant,
    quote: RouteQuote,
}

type QuoteKey = (RouteSource, Address, Address, U256);

/// Uniform quote client over every routing source.
pub struct AggregatorClient {
    chain_id: u64,
    http: reqwest::Client,
    pool: Arc<RpcPool>,
    limiters: Arc<ApiRateLimiters>,
    cache: RwLock<FxHashMap<QuoteKey, CachedQuote>>,
    priority: Vec<RouteSource>,
    /// Optional per-provider API credentials from the environment
    openocean_key: Option<String>,
    odos_key: Option<String>,
    kyber_client_id: Option<String>,
}

impl AggregatorClient {
    pub fn new(config: &Config, pool: Arc<RpcPool>, limiters: Arc<ApiRateLimiters>) -> Self {
        let mut priority = Vec::new();
        for name in &config.aggregator_priority {
            if let Some(id) = AggregatorId::from_name(name) {
                priority.push(RouteSource::Aggregator(id));
            } else {
                warn!("[AGG] unknown aggregator {name} in priority list, skipping");
            }
        }
        for name in &config.monitored_dexes {
            if let Some(id) = DexId::from_name(name) {
                priority.push(RouteSource::Dex(id));
            } else {
                warn!("[AGG] unknown DEX {name} in monitored list, skipping");
            }
        }

        Self {
            chain_id: config.chain_id,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build HTTP client"),
            pool,
            limiters,
            cache: RwLock::new(FxHashMap::default()),
            priority,
            openocean_key: std::env::var("OPENOCEAN_API_KEY").ok(),
            odos_key: std::env::var("ODOS_API_KEY").ok(),
            kyber_client_id: std::env::var("KYBER_CLIENT_ID").ok(),
        }
    }

    pub fn sources(&self) -> &[RouteSource] {
        &self.priority
    }

    /// One quote from one source, cached for a few seconds.
    pub async fn quote(
        &self,
        source: RouteSource,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
        opts: QuoteOptions,
    ) -> Result<RouteQuote, EngineError> {
        let key = (source, from_token, to_token, amount_in);
        if let Some(hit) = self.cache_get(&key).await {
            return Ok(hit);
        }

        let quote = match source {
            RouteSource::Aggregator(AggregatorId::OpenOcean) => {
                self.quote_openocean(from_token, to_token, amount_in, opts).await?
            }
            RouteSource::Aggregator(AggregatorId::Odos) => {
                self.quote_odos(from_token, to_token, amount_in, opts).await?
            }
            RouteSource::Aggregator(AggregatorId::Kyber) => {
                self.quote_kyber(from_token, to_token, amount_in).await?
            }
            RouteSource::Dex(dex) => {
                self.quote_dex(dex, from_token, to_token, amount_in).await?
            }
        };

        if !quote.is_valid() {
            return Err(EngineError::QuoteUnavailable(format!(
                "{source}: quote failed validation ({} out, {} hops)",
                quote.return_amount,
                quote.hops.len()
            )));
        }

        self.cache_put(key, quote.clone()).await;
        Ok(quote)
    }

    /// Best quote across the configured priority: strictly highest output
    /// wins; source order only breaks exact ties.
    pub async fn best_quote(
        &self,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
    ) -> Result<RouteQuote, EngineError> {
        let mut quotes = Vec::new();
        for source in &self.priority {
            match self
                .quote(*source, from_token, to_token, amount_in, QuoteOptions::default())
                .await
            {
                Ok(q) => quotes.push(q),
                Err(e) if e.is_recoverable() || matches!(e, EngineError::QuoteUnavailable(_)) => {
                    debug!("[AGG] {source} quote miss: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        log_quote_spread(&quotes);
        rank_quotes(quotes).ok_or_else(|| {
            EngineError::QuoteUnavailable(format!(
                "all sources failed for {from_token:?}->{to_token:?}"
            ))
        })
    }

    // === HTTP providers ===

    /// Non-2xx or a schema mismatch is a source-level failure.
    async fn read_json<T: serde::de::DeserializeOwned>(
        request: reqwest::RequestBuilder,
        source: &str,
    ) -> Result<T, EngineError> {
        let resp = request
            .send()
            .await
            .map_err(|e| EngineError::QuoteUnavailable(format!("{source}: {e}")))?;
        if !resp.status().is_success() {
            return Err(EngineError::QuoteUnavailable(format!(
                "{source}: HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| EngineError::QuoteUnavailable(format!("{source} schema: {e}")))
    }

    async fn quote_openocean(
        &self,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
        opts: QuoteOptions,
    ) -> Result<RouteQuote, EngineError> {
        self.limiters.acquire("openocean").await;
        let url = format!(
            "{OPENOCEAN_API_BASE}/{}/quote?inTokenAddress={:#x}&outTokenAddress={:#x}&amount={}&slippage={}",
            CHAIN_SLUG,
            from_token,
            to_token,
            amount_in,
            opts.slippage * 100.0
        );
        let mut request = self.http.get(&url);
        if let Some(key) = &self.openocean_key {
            request = request.header("apikey", key);
        }
        let body: OpenOceanResponse = Self::read_json(request, "openocean").await?;
        parse_openocean(body, from_token, to_token)
    }

    async fn quote_odos(
        &self,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
        opts: QuoteOptions,
    ) -> Result<RouteQuote, EngineError> {
        self.limiters.acquire("odos").await;
        let payload = json!({
            "chainId": self.chain_id,
            "inputTokens": [{"tokenAddress": format!("{from_token:#x}"), "amount": amount_in.to_string()}],
            "outputTokens": [{"tokenAddress": format!("{to_token:#x}"), "proportion": 1}],
            "slippageLimitPercent": opts.slippage * 100.0,
            "userAddr": format!("{:#x}", opts.recipient),
            "compact": true,
        });
        let mut request = self.http.post(format!("{ODOS_API_BASE}/sor/quote/v2")).json(&payload);
        if let Some(key) = &self.odos_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let body: OdosQuoteResponse = Self::read_json(request, "odos").await?;
        let mut quote = parse_odos(body, from_token, to_token)?;

        // Callable payload only on request: the assemble call burns a quota
        // slot and is pointless during scanning.
        if opts.assemble {
            if let Some(path_id) = quote_path_id(&quote) {
                quote.provider_payload = self.assemble_odos(&path_id, opts.recipient).await?;
            }
        }
        Ok(quote)
    }

    async fn assemble_odos(
        &self,
        path_id: &str,
        recipient: Address,
    ) -> Result<Bytes, EngineError> {
        self.limiters.acquire("odos").await;
        let payload = json!({
            "userAddr": format!("{recipient:#x}"),
            "pathId": path_id,
        });
        let request = self.http.post(format!("{ODOS_API_BASE}/sor/assemble")).json(&payload);
        let body: OdosAssembleResponse = Self::read_json(request, "odos assemble").await?;
        let data = body
            .transaction
            .and_then(|t| t.data)
            .ok_or_else(|| EngineError::QuoteUnavailable("odos assemble: no calldata".into()))?;
        parse_hex_bytes(&data)
            .ok_or_else(|| EngineError::QuoteUnavailable("odos assemble: bad calldata".into()))
    }

    async fn quote_kyber(
        &self,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
    ) -> Result<RouteQuote, EngineError> {
        self.limiters.acquire("kyberswap").await;
        let url = format!(
            "{KYBER_API_BASE}/{}/api/v1/routes?tokenIn={:#x}&tokenOut={:#x}&amountIn={}",
            CHAIN_SLUG, from_token, to_token, amount_in
        );
        let mut request = self.http.get(&url);
        if let Some(id) = &self.kyber_client_id {
            request = request.header("x-client-id", id);
        }
        let body: KyberResponse = Self::read_json(request, "kyberswap").await?;
        parse_kyber(body, from_token, to_token)
    }

    // === Direct DEX routers ===

    async fn quote_dex(
        &self,
        dex: DexId,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
    ) -> Result<RouteQuote, EngineError> {
        if dex.is_v3() {
            self.quote_v3(dex, from_token, to_token, amount_in).await
        } else {
            self.quote_v2(dex, from_token, to_token, amount_in).await
        }
    }

    /// Iterate fee tiers, pick the first pool with positive liquidity, and
    /// quote it through the quoter.
    async fn quote_v3(
        &self,
        dex: DexId,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
    ) -> Result<RouteQuote, EngineError> {
        let addrs = dex_addresses(dex);

        for fee in V3_FEE_TIERS {
            // Resolve the tier's pool and read its depth in one trip
            let (pool_addr, liquidity, sqrt_price) = self
                .pool
                .execute(|provider| async move {
                    let factory = IUniswapV3Factory::new(addrs.factory, provider.clone());
                    let pool_addr = factory
                        .get_pool(from_token, to_token, fee)
                        .call()
                        .await
                        .map_err(contract_err)?;
                    if pool_addr == Address::zero() {
                        return Ok((pool_addr, 0u128, U256::zero()));
                    }
                    let pool = IUniswapV3Pool::new(pool_addr, provider);
                    let liquidity = pool.liquidity().call().await.map_err(contract_err)?;
                    let (sqrt_price, ..) = pool.slot_0().call().await.map_err(contract_err)?;
                    Ok((pool_addr, liquidity, sqrt_price))
                })
                .await?;
            // Skip unresolved tiers and uninitialized pools (zero sqrt price)
            if pool_addr == Address::zero() || liquidity == 0 || sqrt_price.is_zero() {
                continue;
            }

            let amount_out = self
                .pool
                .execute(|provider| async move {
                    let quoter = IQuoter::new(addrs.quoter, provider);
                    quoter
                        .quote_exact_input_single(from_token, to_token, fee, amount_in, U256::zero())
                        .call()
                        .await
                        .map_err(contract_err)
                })
                .await?;

            return Ok(RouteQuote {
                source: RouteSource::Dex(dex),
                return_amount: amount_out,
                hops: vec![QuoteHop {
                    from_token,
                    to_token,
                    venue: format!("{}:{}bps", dex.as_str(), fee / 100).into(),
                }],
                gas_estimate: V3_SWAP_GAS,
                price_impact: RouteSource::Dex(dex).base_slippage(),
                provider_payload: Bytes::new(),
            });
        }

        Err(EngineError::QuoteUnavailable(format!(
            "{}: no funded pool for {from_token:?}->{to_token:?}",
            dex.as_str()
        )))
    }

    async fn quote_v2(
        &self,
        dex: DexId,
        from_token: Address,
        to_token: Address,
        amount_in: U256,
    ) -> Result<RouteQuote, EngineError> {
        let addrs = dex_addresses(dex);

        let amounts = match dex {
            DexId::Aerodrome => {
                self.pool
                    .execute(|provider| async move {
                        let router = IAerodromeRouter::new(addrs.router, provider);
                        let routes = vec![Route {
                            from: from_token,
                            to: to_token,
                            stable: false,
                            factory: addrs.factory,
                        }];
                        router
                            .get_amounts_out(amount_in, routes)
                            .call()
                            .await
                            .map_err(contract_err)
                    })
                    .await?
            }
            _ => {
                self.pool
                    .execute(|provider| async move {
                        let router = IV2Router::new(addrs.router, provider);
                        router
                            .get_amounts_out(amount_in, vec![from_token, to_token])
                            .call()
                            .await
                            .map_err(contract_err)
                    })
                    .await?
            }
        };

        let amount_out = amounts.last().copied().unwrap_or_default();
        Ok(RouteQuote {
            source: RouteSource::Dex(dex),
            return_amount: amount_out,
            hops: vec![QuoteHop {
                from_token,
                to_token,
                venue: dex.as_str().into(),
            }],
            gas_estimate: V2_SWAP_GAS,
            price_impact: RouteSource::Dex(dex).base_slippage(),
            provider_payload: Bytes::new(),
        })
    }

    // === Cache ===

    async fn cache_get(&self, key: &QuoteKey) -> Option<RouteQuote> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|c| c.at.elapsed() < QUOTE_TTL)
            .map(|c| c.quote.clone())
    }

    async fn cache_put(&self, key: QuoteKey, quote: RouteQuote) {
        let mut cache = self.cache.write().await;
        // Lazy expiry keeps the map bounded without a sweeper task
        if cache.len() > 2_048 {
            cache.retain(|_, c| c.at.elapsed() < QUOTE_TTL);
        }
        cache.insert(key, CachedQuote { at: Instant::now(), quote });
    }
}

// === Pure parsing/ranking helpers ===

fn contract_err<E: std::fmt::Display>(e: E) -> ethers::providers::ProviderError {
    ethers::providers::ProviderError::CustomError(e.to_string())
}

fn parse_hex_bytes(s: &str) -> Option<Bytes> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).ok().map(Bytes::from)
}

/// "0.12%" or "0.12" → fraction.
fn parse_impact_percent(s: &str) -> f64 {
    s.trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map(|p| (p / 100.0).abs())
        .unwrap_or(0.0)
}

fn parse_gas_value(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64().map(|f| f as u64),
        _ => None,
    }
}

fn parse_openocean(
    body: OpenOceanResponse,
    from_token: Address,
    to_token: Address,
) -> Result<RouteQuote, EngineError> {
    if body.code != Some(200) {
        return Err(EngineError::QuoteUnavailable(format!(
            "openocean: code {:?}",
            body.code
        )));
    }
    let data = body
        .data
        .ok_or_else(|| EngineError::QuoteUnavailable("openocean: empty data".into()))?;
    let return_amount = data
        .out_amount
        .as_deref()
        .and_then(|s| U256::from_dec_str(s).ok())
        .ok_or_else(|| EngineError::QuoteUnavailable("openocean: bad outAmount".into()))?;
    let gas_estimate = data
        .estimated_gas
        .as_ref()
        .and_then(parse_gas_value)
        .unwrap_or(200_000);
    let price_impact = data
        .price_impact
        .as_deref()
        .map(parse_impact_percent)
        .unwrap_or(0.0);

    Ok(RouteQuote {
        source: RouteSource::Aggregator(AggregatorId::OpenOcean),
        return_amount,
        hops: vec![QuoteHop {
            from_token,
            to_token,
            venue: "openocean".into(),
        }],
        gas_estimate,
        price_impact,
        provider_payload: Bytes::new(),
    })
}

fn parse_odos(
    body: OdosQuoteResponse,
    from_token: Address,
    to_token: Address,
) -> Result<RouteQuote, EngineError> {
    let return_amount = body
        .out_amounts
        .first()
        .and_then(|s| U256::from_dec_str(s).ok())
        .ok_or_else(|| EngineError::QuoteUnavailable("odos: bad outAmounts".into()))?;
    let gas_estimate = body.gas_estimate.map(|g| g as u64).unwrap_or(200_000);
    let price_impact = body.price_impact.map(|p| (p / 100.0).abs()).unwrap_or(0.0);

    // The pathId rides in the payload until assemble replaces it with real
    // calldata; the executor never sees an unassembled Odos hop.
    let provider_payload = body
        .path_id
        .map(|id| Bytes::from(id.into_bytes()))
        .unwrap_or_default();

    Ok(RouteQuote {
        source: RouteSource::Aggregator(AggregatorId::Odos),
        return_amount,
        hops: vec![QuoteHop {
            from_token,
            to_token,
            venue: "odos".into(),
        }],
        gas_estimate,
        price_impact,
        provider_payload,
    })
}

fn parse_kyber(
    body: KyberResponse,
    from_token: Address,
    to_token: Address,
) -> Result<RouteQuote, EngineError> {
    let summary = body
        .data
        .and_then(|d| d.route_summary)
        .ok_or_else(|| EngineError::QuoteUnavailable("kyberswap: empty routeSummary".into()))?;
    let return_amount = summary
        .amount_out
        .as_deref()
        .and_then(|s| U256::from_dec_str(s).ok())
        .ok_or_else(|| EngineError::QuoteUnavailable("kyberswap: bad amountOut".into()))?;
    let gas_estimate = summary
        .gas
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(200_000);

    Ok(RouteQuote {
        source: RouteSource::Aggregator(AggregatorId::Kyber),
        return_amount,
        hops: vec![QuoteHop {
            from_token,
            to_token,
            venue: "kyberswap".into(),
        }],
        gas_estimate,
        price_impact: 0.0,
        provider_payload: Bytes::new(),
    })
}

/// Odos stashes its pathId in the payload before assembly.
fn quote_path_id(quote: &RouteQuote) -> Option<String> {
    if quote.source != RouteSource::Aggregator(AggregatorId::Odos)
        || quote.provider_payload.is_empty()
    {
        return None;
    }
    String::from_utf8(quote.provider_payload.to_vec()).ok()
}

/// Highest return wins; input order breaks ties.
fn rank_quotes(mut quotes: Vec<RouteQuote>) -> Option<RouteQuote> {
    quotes.sort_by(|a, b| b.return_amount.cmp(&a.return_amount));
    quotes.into_iter().next()
}

fn log_quote_spread(quotes: &[RouteQuote]) {
    if quotes.len() < 2 {
        return;
    }
    let best = quotes.iter().map(|q| q.return_amount).max().unwrap_or_default();
    let worst = quotes.iter().map(|q| q.return_amount).min().unwrap_or_default();
    if best.is_zero() {
        return;
    }
    let spread_bps = (best - worst) * U256::from(10_000u64) / best;
    info!("[AGG] {} sources, spread {} ({spread_bps} bps)", quotes.len(), best - worst);
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn quote_with(source: RouteSource, out: u64) -> RouteQuote {
        RouteQuote {
            source,
            return_amount: U256::from(out),
            hops: vec![QuoteHop {
                from_token: addr(1),
                to_token: addr(2),
                venue: "x".into(),
            }],
            gas_estimate: 100_000,
            price_impact: 0.001,
            provider_payload: Bytes::new(),
        }
    }

    #[test]
    fn test_provider_parsing() {
        // Ranking is deterministic: strictly highest output wins
        let quotes = vec![
            quote_with(RouteSource::Aggregator(AggregatorId::OpenOcean), 900),
            quote_with(RouteSource::Dex(DexId::UniswapV3), 1_100),
            quote_with(RouteSource::Aggregator(AggregatorId::Kyber), 1_000),
        ];
        let best = rank_quotes(quotes).unwrap();
        assert_eq!(best.source, RouteSource::Dex(DexId::UniswapV3));
        assert!(rank_quotes(vec![]).is_none());

        let body = OpenOceanResponse {
            code: Some(200),
            data: Some(OpenOceanData {
                out_amount: Some("123456789".to_string()),
                estimated_gas: Some(serde_json::json!("185000")),
                price_impact: Some("0.25%".to_string()),
            }),
        };
        let q = parse_openocean(body, addr(1), addr(2)).unwrap();
        assert_eq!(q.return_amount, U256::from(123_456_789u64));
        assert_eq!(q.gas_estimate, 185_000);
        assert!((q.price_impact - 0.0025).abs() < 1e-9);
        assert!(q.is_valid());
        let failed = OpenOceanResponse { code: Some(500), data: None };
        assert!(parse_openocean(failed, addr(1), addr(2)).is_err());

        // Odos stashes its pathId for the assemble step
        let body = OdosQuoteResponse {
            out_amounts: vec!["5000000".to_string()],
            gas_estimate: Some(210_000.0),
            price_impact: Some(0.5),
            path_id: Some("abc123".to_string()),
        };
        let q = parse_odos(body, addr(1), addr(2)).unwrap();
        assert_eq!(q.return_amount, U256::from(5_000_000u64));
        assert_eq!(quote_path_id(&q).as_deref(), Some("abc123"));
        assert!((q.price_impact - 0.005).abs() < 1e-9);

        let body = KyberResponse {
            data: Some(KyberData {
                route_summary: Some(KyberRouteSummary {
                    amount_out: Some("777".to_string()),
                    gas: Some("150000".to_string()),
                }),
            }),
        };
        let q = parse_kyber(body, addr(1), addr(2)).unwrap();
        assert_eq!(q.return_amount, U256::from(777u64));
        assert_eq!(q.gas_estimate, 150_000);
        let empty = KyberResponse { data: Some(KyberData { route_summary: None }) };
        assert!(parse_kyber(empty, addr(1), addr(2)).is_err());
    }

    #[tokio::test]
    async fn test_quote_cache_round_trip() {
        let config = Config::default();
        let metrics = Arc::new(crate::metrics::Metrics::new());
        let pool = Arc::new(
            RpcPool::new(&config.rpc_nodes, config.rpc_settings.clone(), metrics).unwrap(),
        );
        let limiters = Arc::new(ApiRateLimiters::from_config(&config));
        let client = AggregatorClient::new(&config, pool, limiters);
        // 3 aggregators then 4 DEXes, aggregators first
        assert_eq!(client.sources().len(), 7);
        assert!(matches!(client.sources()[0], RouteSource::Aggregator(_)));

        let key = (
            RouteSource::Dex(DexId::UniswapV3),
            addr(1),
            addr(2),
            U256::from(1_000u64),
        );
        assert!(client.cache_get(&key).await.is_none());

        let quote = quote_with(RouteSource::Dex(DexId::UniswapV3), 999);
        client.cache_put(key, quote.clone()).await;

        // Two consecutive reads within the TTL return the identical route
        let first = client.cache_get(&key).await.unwrap();
        let second = client.cache_get(&key).await.unwrap();
        assert_eq!(first.return_amount, second.return_amount);
        assert_eq!(first.source, second.source);
        assert_eq!(first.hops.len(), second.hops.len());
    }
}
