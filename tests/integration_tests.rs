// tests/integration_tests.rs
// Holistic integration tests for the arbitrage engine
//
// These tests verify the full flow without touching the network:
// 1. Opportunity economics (accountant breakdown over a seeded registry)
// 2. MEV vetoes under adversarial mempool states
// 3. Gas wait-or-go decisions
// 4. Statistical signal extraction from synthetic cointegrated prices
// 5. RPC failover behavior
// 6. Orchestrator error escalation and shutdown

use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

use flasharb::aggregator::AggregatorClient;
use flasharb::config::Config;
use flasharb::gas::GasOracle;
use flasharb::metrics::Metrics;
use flasharb::rate_limit::ApiRateLimiters;
use flasharb::registry::TokenRegistry;
use flasharb::rpc::RpcPool;
use flasharb::types::{
    gwei_to_wei, DexId, Hop, Opportunity, OpportunityKind, RouteSource,
};
use flasharb::zscore::ZScoreEngine;

// Well-known throwaway key (Hardhat account #0)
const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

fn make_pool(config: &Config, metrics: Arc<Metrics>) -> Arc<RpcPool> {
    Arc::new(RpcPool::new(&config.rpc_nodes, config.rpc_settings.clone(), metrics).unwrap())
}

fn make_zscore_engine(config: &Config) -> (Arc<ZScoreEngine>, Arc<TokenRegistry>) {
    let metrics = Arc::new(Metrics::new());
    let pool = make_pool(config, metrics);
    let limiters = Arc::new(ApiRateLimiters::from_config(config));
    let registry = Arc::new(TokenRegistry::new(config, limiters.clone()));
    let aggregator = Arc::new(AggregatorClient::new(config, pool, limiters.clone()));
    let numeraire: Address = config.base_tokens[0].parse().unwrap();
    let engine = Arc::new(ZScoreEngine::new(
        config,
        numeraire,
        registry.clone(),
        aggregator,
        limiters,
    ));
    (engine, registry)
}

/// Seed the default base tokens with realistic prices and deep liquidity.
async fn seed_market_data(registry: &TokenRegistry, config: &Config) {
    registry.seed_base_tokens(config).await.unwrap();
    let weth: Address = config.base_tokens[0].parse().unwrap();
    let usdc: Address = config.base_tokens[1].parse().unwrap();
    let cbeth: Address = config.base_tokens[2].parse().unwrap();
    registry.update_market_data(weth, 1_825.0, 10_000_000.0).await;
    registry.update_market_data(usdc, 1.0, 50_000_000.0).await;
    registry.update_market_data(cbeth, 3_041.67, 8_000_000.0).await;
}

/// WETH → USDC → cbETH → WETH at a given output edge (fraction of input).
fn triangular_opportunity(config: &Config, edge: f64) -> Opportunity {
    let weth: Address = config.base_tokens[0].parse().unwrap();
    let usdc: Address = config.base_tokens[1].parse().unwrap();
    let cbeth: Address = config.base_tokens[2].parse().unwrap();

    let one_weth = U256::exp10(18);
    let usdc_amount = U256::from(1_825_000_000u64); // 1825 USDC
    let cbeth_amount = U256::exp10(18) * 6 / 10; // 0.6 cbETH
    let out = one_weth + U256::from((1e18 * edge) as u128);

    let hop = |from, to, amount_in, min_out| Hop {
        from_token: from,
        to_token: to,
        amount_in,
        min_amount_out: min_out,
        source: RouteSource::Dex(DexId::UniswapV3),
        payload: Bytes::from(vec![0x01]),
        gas_estimate: 150_000,
        price_impact: 0.0005,
    };

    Opportunity {
        id: 1,
        kind: OpportunityKind::Triangular,
        hops: vec![
            hop(weth, usdc, one_weth, usdc_amount),
            hop(usdc, cbeth, usdc_amount, cbeth_amount),
            hop(cbeth, weth, cbeth_amount, out),
        ],
        amount_in: one_weth,
        expected_out: out,
        gross_profit_percent: edge * 100.0,
        deadline: chrono::Utc::now().timestamp() + 60,
        zscore: None,
        score: 10.0,
        path_liquidity_usd: 15_000_000.0,
    }
}

/// Deterministic pseudo-noise in [-0.5, 0.5).
fn lcg(seed: u64) -> impl FnMut() -> f64 {
    let mut state = seed.max(1);
    move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
    }
}

// ============================================================================
// SCENARIO A - Happy-path triangular economics
// ============================================================================

mod happy_path_triangular {
    use super::*;
    use flasharb::profit::{compose_breakdown, ProfitAccountant};

    async fn seeded_accountant(config: &Config) -> ProfitAccountant {
        let (zscore, registry) = make_zscore_engine(config);
        seed_market_data(&registry, config).await;

        let metrics = Arc::new(Metrics::new());
        let gas_oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics));
        // Calm L2 fee regime: 0.1 gwei base, 0.05 gwei tip
        gas_oracle
            .record_sample(gwei_to_wei(0.1), gwei_to_wei(0.05), 0.4)
            .await;

        let numeraire: Address = config.base_tokens[0].parse().unwrap();
        ProfitAccountant::new(
            registry,
            gas_oracle,
            zscore,
            numeraire,
            config.min_profit_threshold_usd,
            config.flash_loan_premium_bps,
        )
    }

    /// Test: the reference numbers compose into an executable breakdown
    #[test]
    fn test_reference_numbers_meet_threshold() {
        // 1.0 WETH in, 1.002 WETH out at $1825; gas $0.30, flash fee $1.80,
        // slippage buffer $0.50
        let b = compose_breakdown(3.65, 0.30, 1.80, 0.50, 1_825.0, 1.0);
        assert!(b.net_profit_usd >= 1.0);
        assert!(b.meets_threshold);
    }

    /// Test: full accountant pipeline prices a 1% triangular edge as
    /// profitable and the local simulation accepts it
    #[tokio::test]
    async fn test_profitable_triangle_clears_pipeline() {
        let config = Config::default();
        let accountant = seeded_accountant(&config).await;
        let opp = triangular_opportunity(&config, 0.01);

        assert!(opp.validate_shape(chrono::Utc::now().timestamp()).is_ok());

        let breakdown = accountant.analyze(&opp, None).await.unwrap();
        assert!(
            (breakdown.gross_profit_usd - 18.25).abs() < 0.1,
            "gross should be ~$18.25, got {}",
            breakdown.gross_profit_usd
        );
        assert!(breakdown.gas_cost_usd > 0.0 && breakdown.gas_cost_usd < 1.0);
        // 5 bps on $1825 principal
        assert!((breakdown.flash_loan_cost_usd - 0.9125).abs() < 0.01);
        assert!(breakdown.slippage_buffer_usd > 0.0);
        assert!(breakdown.net_profit_usd >= 1.0);
        assert!(breakdown.meets_threshold);

        // Local simulation succeeds iff projected net profit is positive
        let simulated = accountant.simulate(&opp, None, config.chain_id).await.unwrap();
        assert!(simulated.net_profit_usd > 0.0);
    }

    /// Test: a hairline edge is rejected by simulation
    #[tokio::test]
    async fn test_thin_edge_fails_simulation() {
        let config = Config::default();
        let accountant = seeded_accountant(&config).await;
        // 0.01% edge: gross ~$0.18 cannot cover costs
        let opp = triangular_opportunity(&config, 0.0001);

        let breakdown = accountant.analyze(&opp, None).await.unwrap();
        assert!(!breakdown.meets_threshold);
        assert!(accountant.simulate(&opp, None, config.chain_id).await.is_err());
    }

    /// Test: closed-cycle invariant holds on every constructed opportunity
    #[test]
    fn test_closed_cycle_invariant() {
        let config = Config::default();
        let opp = triangular_opportunity(&config, 0.01);
        assert_eq!(
            opp.hops[0].from_token,
            opp.hops[opp.hops.len() - 1].to_token
        );
        assert_eq!(opp.flash_asset(), Some(config.base_tokens[0].parse().unwrap()));
    }
}

// ============================================================================
// SCENARIO B - MEV sandwich veto
// ============================================================================

mod mev_veto {
    use super::*;
    use flasharb::mev::{MevGuard, MevKind, PendingObservation};
    use std::time::Instant;

    fn swap_observation(router: Address, gas_gwei: f64) -> PendingObservation {
        let mut data = vec![0x38, 0xed, 0x17, 0x39]; // swapExactTokensForTokens
        data.extend_from_slice(&[0u8; 64]);
        PendingObservation {
            hash: Default::default(),
            from: addr(0xAA),
            to: Some(router),
            gas_price: gwei_to_wei(gas_gwei),
            input: Bytes::from(data),
            kind: MevKind::Sandwich,
            confidence: 0.6,
            seen_at: Instant::now(),
        }
    }

    /// Test: two pending 150-gwei swaps on the first hop's router block the
    /// opportunity with the sandwich reason
    #[tokio::test]
    async fn test_sandwich_on_first_hop_vetoes() {
        let config = Config::default();
        let guard = MevGuard::new(500.0);
        let opp = triangular_opportunity(&config, 0.01);
        let router =
            flasharb::aggregator::source_router(RouteSource::Dex(DexId::UniswapV3));

        guard.push(swap_observation(router, 150.0)).await;
        guard.push(swap_observation(router, 150.0)).await;

        let err = guard
            .check_opportunity(&opp, gwei_to_wei(1.0), 2.0)
            .await
            .unwrap_err();
        assert_eq!(
            err.veto_reason(),
            "Potential sandwich attack detected on first hop"
        );
    }

    /// Test: the same mempool state on a different router does not veto
    #[tokio::test]
    async fn test_sandwich_elsewhere_passes() {
        let config = Config::default();
        let guard = MevGuard::new(500.0);
        let opp = triangular_opportunity(&config, 0.01);
        let other_router =
            flasharb::aggregator::source_router(RouteSource::Dex(DexId::Baseswap));

        guard.push(swap_observation(other_router, 150.0)).await;
        guard.push(swap_observation(other_router, 150.0)).await;

        assert!(guard
            .check_opportunity(&opp, gwei_to_wei(1.0), 2.0)
            .await
            .is_ok());
    }

    /// Test: a vetoed opportunity is a per-opportunity veto, never fatal
    #[tokio::test]
    async fn test_veto_classification() {
        let config = Config::default();
        let guard = MevGuard::new(0.5);
        let opp = triangular_opportunity(&config, 0.01);
        let err = guard
            .check_opportunity(&opp, gwei_to_wei(1.0), 2.0)
            .await
            .unwrap_err();
        assert!(err.is_veto());
        assert!(!err.is_cycle_error());
    }
}

// ============================================================================
// SCENARIO C - Gas wait
// ============================================================================

mod gas_wait {
    use super::*;

    /// Test: gas at 40% of expected profit defers the cycle
    #[tokio::test]
    async fn test_wait_when_gas_is_40_percent_of_profit() {
        let oracle = GasOracle::new(50.0, Arc::new(Metrics::new()));
        let decision = oracle.should_wait_for_better_gas(4.0, 10.0).await;
        assert!(decision.wait);
        assert_eq!(decision.reason.as_deref(), Some("Gas cost > 30% of profit"));
        assert!(decision.wait_blocks > 0);
    }

    /// Test: cheap gas does not defer
    #[tokio::test]
    async fn test_no_wait_when_gas_is_cheap() {
        let oracle = GasOracle::new(50.0, Arc::new(Metrics::new()));
        oracle
            .record_sample(gwei_to_wei(0.1), gwei_to_wei(0.05), 0.4)
            .await;
        let decision = oracle.should_wait_for_better_gas(0.3, 10.0).await;
        assert!(!decision.wait);
        assert!(decision.reason.is_none());
    }

    /// Test: recommended fees never exceed the configured ceiling
    #[tokio::test]
    async fn test_fee_ceiling_invariant() {
        let oracle = GasOracle::new(2.0, Arc::new(Metrics::new()));
        oracle
            .record_sample(gwei_to_wei(40.0), gwei_to_wei(20.0), 0.5)
            .await;
        let params = oracle
            .optimal_gas_params(
                flasharb::gas::TxComplexity::FlashLoan,
                flasharb::gas::TxUrgency::Urgent,
            )
            .await;
        assert!(params.max_fee_per_gas <= gwei_to_wei(2.0));
        assert!(params.max_priority_fee_per_gas <= params.max_fee_per_gas);
    }
}

// ============================================================================
// SCENARIO D - Statistical signal extraction
// ============================================================================

mod statistical_signal {
    use super::*;
    use flasharb::types::PairKind;
    use flasharb::types::TokenPair;
    use flasharb::zscore::TradeSignal;

    /// Build two synthetic price series where A tracks 2×B with a
    /// fast-reverting spread, ending on a stretched ratio.
    fn cointegrated_series(n: usize) -> (Vec<f64>, Vec<f64>) {
        let mut noise = lcg(17);
        let mut spread_noise = lcg(71);
        let mut b = Vec::with_capacity(n);
        let mut a = Vec::with_capacity(n);
        let mut level: f64 = 100.0;
        let mut spread: f64 = 0.0;
        for i in 0..n {
            level = (level + noise() * 0.5).max(50.0);
            spread = 0.3 * spread + spread_noise() * 0.01;
            // Final sample: ratio stretched well past the entry threshold
            let s = if i == n - 1 { 0.02 } else { spread };
            b.push(level);
            a.push(2.0 * level * s.exp());
        }
        (a, b)
    }

    /// Test: cointegrated pair with a stretched ratio emits SHORT_A_LONG_B
    /// with usable confidence
    #[tokio::test]
    async fn test_signal_from_synthetic_pair() {
        let mut config = Config::default();
        config.zscore_settings.window_size = 100;
        config.zscore_settings.lookback = 100;

        let (engine, registry) = make_zscore_engine(&config);
        seed_market_data(&registry, &config).await;

        let token_a = addr(0xA1);
        let token_b = addr(0xB2);
        let (a, b) = cointegrated_series(150);
        for i in 0..150 {
            engine.record_price(token_a, a[i], i as i64 * 30).await;
            engine.record_price(token_b, b[i], i as i64 * 30).await;
        }

        let pair = TokenPair::new(token_a, token_b, PairKind::BaseAlt);
        let stats = engine.cointegration(&pair).await;
        assert!(stats.cointegrated, "synthetic pair should cointegrate: {stats:?}");
        assert!((stats.slope - 1.0).abs() < 0.2, "log-log slope near 1");

        let signal = engine.signal(&pair).await.expect("signal for cointegrated pair");
        assert!(signal.zscore > 2.0, "stretched ratio should clear entry, z={}", signal.zscore);
        assert_eq!(signal.signal, TradeSignal::ShortALongB);
        assert!(signal.confidence > 0.0 && signal.confidence <= 1.0);
    }

    /// Test: z-scores are a pure function of the sample window
    #[tokio::test]
    async fn test_zscore_deterministic() {
        let mut config = Config::default();
        config.zscore_settings.window_size = 100;
        config.zscore_settings.lookback = 100;

        let (engine, _) = make_zscore_engine(&config);
        let token_a = addr(0xA1);
        let token_b = addr(0xB2);
        let (a, b) = cointegrated_series(150);
        for i in 0..150 {
            engine.record_price(token_a, a[i], i as i64 * 30).await;
            engine.record_price(token_b, b[i], i as i64 * 30).await;
        }

        let pair = TokenPair::new(token_a, token_b, PairKind::BaseAlt);
        let first = engine.signal(&pair).await.unwrap();
        // Cached read within the TTL: identical to the bit
        let second = engine.signal(&pair).await.unwrap();
        assert_eq!(first.zscore.to_bits(), second.zscore.to_bits());
    }

    /// Test: a pair without enough samples yields no signal
    #[tokio::test]
    async fn test_thin_history_no_signal() {
        let config = Config::default();
        let (engine, _) = make_zscore_engine(&config);
        let token_a = addr(0xA1);
        let token_b = addr(0xB2);
        for i in 0..50 {
            engine.record_price(token_a, 200.0, i * 30).await;
            engine.record_price(token_b, 100.0, i * 30).await;
        }
        let pair = TokenPair::new(token_a, token_b, PairKind::BaseAlt);
        assert!(engine.signal(&pair).await.is_none());
    }
}

// ============================================================================
// SCENARIO E - RPC failover
// ============================================================================

mod rpc_failover {
    use super::*;

    fn three_endpoint_pool() -> Arc<RpcPool> {
        let mut config = Config::default();
        config.rpc_nodes = vec![
            "http://one.invalid".to_string(),
            "http://two.invalid".to_string(),
            "http://three.invalid".to_string(),
        ];
        make_pool(&config, Arc::new(Metrics::new()))
    }

    /// Test: three consecutive failures park the endpoint; traffic moves on
    #[test]
    fn test_three_failures_route_around() {
        let pool = three_endpoint_pool();
        for _ in 0..3 {
            pool.endpoints()[0].record_failure();
        }
        assert!(!pool.endpoints()[0].is_healthy());

        for _ in 0..9 {
            assert_ne!(pool.endpoint().url, "http://one.invalid");
        }
    }

    /// Test: a successful probe restores the endpoint into rotation
    #[test]
    fn test_probe_restores_endpoint() {
        let pool = three_endpoint_pool();
        for _ in 0..3 {
            pool.endpoints()[0].record_failure();
        }
        pool.endpoints()[0].restore();
        assert!(pool.endpoints()[0].is_healthy());
        assert_eq!(pool.endpoints()[0].failure_count(), 0);

        // Back in rotation
        let mut seen_one = false;
        for _ in 0..6 {
            if pool.endpoint().url == "http://one.invalid" {
                seen_one = true;
            }
        }
        assert!(seen_one);
    }

    /// Test: a partial failure streak does not park the endpoint
    #[test]
    fn test_two_failures_keep_healthy() {
        let pool = three_endpoint_pool();
        pool.endpoints()[0].record_failure();
        pool.endpoints()[0].record_failure();
        assert!(pool.endpoints()[0].is_healthy());
        pool.endpoints()[0].record_success();
        assert_eq!(pool.endpoints()[0].failure_count(), 0);
    }
}

// ============================================================================
// SCENARIO F - Error escalation and shutdown
// ============================================================================

mod shutdown {
    use super::*;
    use flasharb::alerts::Alerter;
    use flasharb::error::EngineError;
    use flasharb::gas::GasOracle;
    use flasharb::mev::MevGuard;
    use flasharb::orchestrator::{BotState, Orchestrator};
    use flasharb::profit::ProfitAccountant;
    use flasharb::scanner::OpportunityScanner;
    use flasharb::txbuilder::TxBuilder;

    fn make_orchestrator() -> Orchestrator {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let pool = make_pool(&config, metrics.clone());
        let limiters = Arc::new(ApiRateLimiters::from_config(&config));
        let registry = Arc::new(TokenRegistry::new(&config, limiters.clone()));
        let aggregator =
            Arc::new(AggregatorClient::new(&config, pool.clone(), limiters.clone()));
        let numeraire: Address = config.base_tokens[0].parse().unwrap();
        let zscore = Arc::new(ZScoreEngine::new(
            &config,
            numeraire,
            registry.clone(),
            aggregator.clone(),
            limiters,
        ));
        let gas_oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics.clone()));
        let accountant = Arc::new(ProfitAccountant::new(
            registry.clone(),
            gas_oracle.clone(),
            zscore.clone(),
            numeraire,
            config.min_profit_threshold_usd,
            config.flash_loan_premium_bps,
        ));
        let base_addrs: Vec<Address> =
            config.base_tokens.iter().map(|t| t.parse().unwrap()).collect();
        let scanner = Arc::new(OpportunityScanner::new(
            registry.clone(),
            aggregator,
            zscore.clone(),
            base_addrs,
            config.max_hops,
        ));
        let guard = Arc::new(MevGuard::new(config.max_gas_price_gwei));
        let txbuilder = Arc::new(
            TxBuilder::new(
                TEST_KEY,
                addr(0xEE),
                config.chain_id,
                pool.clone(),
                gas_oracle.clone(),
            )
            .unwrap(),
        );
        let alerter = Arc::new(Alerter::with_log_sink());

        Orchestrator::new(
            config, registry, zscore, scanner, accountant, guard, gas_oracle, txbuilder,
            pool, metrics, alerter,
        )
    }

    /// Test: ten consecutive cycle errors reach EmergencyShutdown without
    /// further execution
    #[tokio::test]
    async fn test_ten_errors_trigger_emergency_shutdown() {
        let orch = make_orchestrator();
        for _ in 0..10 {
            orch.record_cycle_error(&EngineError::ContractReverted("0xdead".into()))
                .await;
        }
        assert_eq!(orch.state().await, BotState::EmergencyShutdown);

        // run() must refuse to enter the loop afterwards
        orch.run().await;
        assert_eq!(orch.state().await, BotState::EmergencyShutdown);
    }

    /// Test: a graceful stop lands in Stopped with nothing pending
    #[tokio::test]
    async fn test_graceful_stop_drains() {
        let orch = make_orchestrator();
        orch.stop().await;
        orch.run().await;
        assert_eq!(orch.state().await, BotState::Stopped);
    }

    /// Test: vetoes do not advance the consecutive-error counter
    #[tokio::test]
    async fn test_vetoes_are_not_cycle_errors() {
        let veto = EngineError::MEVVeto("sandwich".into());
        let below = EngineError::ProfitBelowThreshold { net: 0.2, threshold: 1.0 };
        assert!(veto.is_veto() && !veto.is_cycle_error());
        assert!(below.is_veto() && !below.is_cycle_error());
    }
}

// ============================================================================
// CROSS-CUTTING INVARIANTS
// ============================================================================

mod invariants {
    use super::*;
    use flasharb::alerts::{AlertLevel, Alerter};
    use flasharb::gas::GasOracle;
    use flasharb::txbuilder::TxBuilder;

    /// Invariant: nonces increase monotonically across successive builds
    #[tokio::test]
    async fn test_nonce_monotonicity() {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let pool = make_pool(&config, metrics.clone());
        let oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics));
        let builder =
            TxBuilder::new(TEST_KEY, addr(0xEE), config.chain_id, pool, oracle).unwrap();
        builder.seed_nonce(100).await;

        let opp = triangular_opportunity(&config, 0.01);
        let params = flasharb::gas::GasParams {
            max_fee_per_gas: gwei_to_wei(1.0),
            max_priority_fee_per_gas: gwei_to_wei(0.5),
            gas_limit: U256::from(900_000u64),
        };

        let mut last_nonce = None;
        for _ in 0..4 {
            let signed = builder
                .build_arbitrage(&opp, params, U256::from(900_000u64), U256::one())
                .await
                .unwrap();
            if let Some(prev) = last_nonce {
                assert!(signed.nonce > prev, "nonces must increase");
            }
            last_nonce = Some(signed.nonce);
        }
    }

    /// Invariant: signed fees never exceed the gas ceiling
    #[tokio::test]
    async fn test_signed_fee_ceiling() {
        let config = Config::default(); // 5 gwei cap
        let metrics = Arc::new(Metrics::new());
        let pool = make_pool(&config, metrics.clone());
        let oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics));
        let builder =
            TxBuilder::new(TEST_KEY, addr(0xEE), config.chain_id, pool, oracle).unwrap();
        builder.seed_nonce(0).await;

        let opp = triangular_opportunity(&config, 0.01);
        let greedy = flasharb::gas::GasParams {
            max_fee_per_gas: gwei_to_wei(500.0),
            max_priority_fee_per_gas: gwei_to_wei(400.0),
            gas_limit: U256::from(900_000u64),
        };
        let signed = builder
            .build_arbitrage(&opp, greedy, U256::from(900_000u64), U256::one())
            .await
            .unwrap();
        assert!(signed.max_fee_per_gas <= gwei_to_wei(config.max_gas_price_gwei));
    }

    /// Invariant: repeated identical alerts respect the level cooldown
    #[test]
    fn test_alert_cooldown() {
        let alerter = Alerter::with_log_sink();
        let data = serde_json::json!({"k": 1});

        assert!(alerter.send(AlertLevel::Warning, "repeat", "msg", data.clone()));
        // Immediate duplicate sits inside the 900s warning cooldown
        assert!(!alerter.send(AlertLevel::Warning, "repeat", "msg", data.clone()));
        // A different payload is a different key
        assert!(alerter.send(AlertLevel::Warning, "repeat", "msg", serde_json::json!({"k": 2})));
    }

    /// Invariant: an opportunity with an elapsed deadline is rejected
    #[test]
    fn test_elapsed_deadline_rejected() {
        let config = Config::default();
        let mut opp = triangular_opportunity(&config, 0.01);
        opp.deadline = chrono::Utc::now().timestamp() - 1;
        assert!(opp.validate_shape(chrono::Utc::now().timestamp()).is_err());
    }

    /// Invariant: empty hop lists never validate
    #[test]
    fn test_empty_hops_rejected() {
        let config = Config::default();
        let mut opp = triangular_opportunity(&config, 0.01);
        opp.hops.clear();
        assert!(opp.validate_shape(0).is_err());
    }
}
