//! Flash-Loan Arbitrage Engine
//!
//! An on-chain arbitrage bot for EVM-compatible L2s. The engine continuously
//! searches for trading paths whose expected output exceeds their input by
//! more than gas + flash-loan premium + expected slippage, and executes the
//! survivors through an on-chain flash-loan contract.
//!
//! ## Architecture
//!
//! - **RPC transport** with per-endpoint token buckets and health tracking
//! - **Statistical detector** built on pair cointegration and rolling z-scores
//! - **Three-family scanner**: statistical, triangular, bounded multi-hop DFS
//! - **Profit accountant** modeling slippage, gas, and flash-loan premiums
//! - **MEV guard** watching the mempool for adversarial conditions
//! - **EIP-1559 builder** with strict nonce discipline
//! - **Orchestrator** with backoff, emergency shutdown, and alerting

mod aggregator;
mod alerts;
mod config;
mod error;
mod gas;
mod metrics;
mod mev;
mod orchestrator;
mod profit;
mod rate_limit;
mod registry;
mod rpc;
mod scanner;
mod txbuilder;
mod types;
mod zscore;

use anyhow::{Context, Result};
use ethers::types::Address;
use std::sync::Arc;
use tracing::{info, warn};

use aggregator::AggregatorClient;
use alerts::Alerter;
use config::Config;
use gas::GasOracle;
use metrics::Metrics;
use mev::MevGuard;
use orchestrator::Orchestrator;
use profit::ProfitAccountant;
use rate_limit::ApiRateLimiters;
use registry::TokenRegistry;
use rpc::RpcPool;
use scanner::OpportunityScanner;
use txbuilder::TxBuilder;
use zscore::ZScoreEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flasharb=info".parse().unwrap()),
        )
        .init();

    info!("🚀 Flash-Loan Arbitrage Engine v0.3");

    // Secrets from the environment
    dotenvy::dotenv().ok();
    let private_key = std::env::var("PRIVATE_KEY").context("PRIVATE_KEY not set")?;
    let executor: Address = std::env::var("EXECUTOR_ADDRESS")
        .context("EXECUTOR_ADDRESS not set (on-chain flash-loan contract)")?
        .parse()
        .context("EXECUTOR_ADDRESS is not an address")?;
    let wallet_override: Option<Address> = std::env::var("WALLET_ADDRESS")
        .ok()
        .map(|v| v.parse().context("WALLET_ADDRESS is not an address"))
        .transpose()?;

    let config = Config::from_env();
    info!("   Chain: {} | {} endpoints | min profit ${:.2} | gas cap {:.1} gwei | premium {} bps",
          config.chain_id, config.rpc_nodes.len(), config.min_profit_threshold_usd,
          config.max_gas_price_gwei, config.flash_loan_premium_bps);
    if config.test_mode {
        info!("   Mode: TEST (set TEST_MODE=0 to execute)");
    } else {
        warn!("   Mode: LIVE EXECUTION");
    }

    // Shared infrastructure
    let metrics = Arc::new(Metrics::new());
    let pool = Arc::new(
        RpcPool::new(&config.rpc_nodes, config.rpc_settings.clone(), metrics.clone())
            .context("failed to build RPC pool")?,
    );
    let limiters = Arc::new(ApiRateLimiters::from_config(&config));
    let alerter = Arc::new(Alerter::with_log_sink());

    // Components, leaves first
    let registry = Arc::new(TokenRegistry::new(&config, limiters.clone()));
    let aggregator = Arc::new(AggregatorClient::new(&config, pool.clone(), limiters.clone()));
    let numeraire: Address = config.base_tokens[0]
        .parse()
        .context("first base token is not an address")?;
    let zscore = Arc::new(ZScoreEngine::new(
        &config,
        numeraire,
        registry.clone(),
        aggregator.clone(),
        limiters.clone(),
    ));
    let gas_oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics.clone()));
    let guard = Arc::new(MevGuard::new(config.max_gas_price_gwei));
    let accountant = Arc::new(ProfitAccountant::new(
        registry.clone(),
        gas_oracle.clone(),
        zscore.clone(),
        numeraire,
        config.min_profit_threshold_usd,
        config.flash_loan_premium_bps,
    ));
    let base_tokens: Vec<Address> = config
        .base_tokens
        .iter()
        .map(|t| t.parse().context("base token is not an address"))
        .collect::<Result<_>>()?;
    let scanner = Arc::new(OpportunityScanner::new(
        registry.clone(),
        aggregator.clone(),
        zscore.clone(),
        base_tokens,
        config.max_hops,
    ));
    let txbuilder = Arc::new(
        TxBuilder::with_address_override(
            &private_key,
            wallet_override,
            executor,
            config.chain_id,
            pool.clone(),
            gas_oracle.clone(),
        )
        .context("failed to build transaction signer")?,
    );
    info!("   Wallet: {:?} | Executor: {executor:?}", txbuilder.wallet_address());

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        registry.clone(),
        zscore.clone(),
        scanner,
        accountant,
        guard.clone(),
        gas_oracle.clone(),
        txbuilder,
        pool.clone(),
        metrics.clone(),
        alerter,
    ));

    // Initialization graph; refuses to start on config errors
    orchestrator
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("initialization failed: {e}"))?;

    // Long-lived cooperative tasks
    tokio::spawn(rpc::run_health_check_loop(pool.clone()));
    tokio::spawn(metrics::run_metrics_exporter(
        metrics.clone(),
        config.metrics_path.clone(),
    ));
    tokio::spawn(gas::run_gas_sampler_loop(gas_oracle.clone(), pool.clone()));
    tokio::spawn(zscore::run_price_sampler_loop(zscore.clone()));
    tokio::spawn(zscore::run_auto_discovery_loop(zscore.clone(), pool.clone()));
    tokio::spawn(registry::run_registry_refresh_loop(registry.clone()));
    tokio::spawn(mev::run_mempool_subscriber(
        guard.clone(),
        pool.clone(),
        gas_oracle.clone(),
    ));

    // Ctrl-C triggers a graceful stop
    let shutdown_orch = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping...");
            shutdown_orch.stop().await;
        }
    });

    info!("✅ All systems operational - entering scan loop");
    orchestrator.run().await;

    info!("engine exited in state {}", orchestrator.state().await);
    Ok(())
}
