//! Initialization graph, scan/evaluate/execute loop, and shutdown paths.
//!
//! State machine: Uninitialized → Initializing → Ready → Running ⇄ Backoff
//! → Stopping → Stopped, with EmergencyShutdown terminal from anywhere.
//! Within a cycle the pipeline is strictly sequential: scanner → accountant
//! → guard → gas → simulate → execute; cycles never overlap.

use ethers::types::U256;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::alerts::{AlertLevel, Alerter};
use crate::config::{Config, SHUTDOWN_DRAIN_SECS};
use crate::error::EngineError;
use crate::gas::{GasOracle, TxComplexity, TxUrgency};
use crate::metrics::Metrics;
use crate::mev::MevGuard;
use crate::profit::{ProfitAccountant, SimulationCall};
use crate::scanner::OpportunityScanner;
use crate::txbuilder::TxBuilder;
use crate::types::{amount_from_f64, wei_to_gwei, Opportunity};

/// Candidates evaluated per cycle.
const TOP_CANDIDATES: usize = 5;

/// Base inter-cycle sleep.
const BASE_SLEEP: Duration = Duration::from_secs(2);

/// Gas-wait sleep bound.
const MAX_GAS_WAIT: Duration = Duration::from_secs(10);

/// Recent executions above this count slow the loop down.
const HEAVY_EXECUTION_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Backoff,
    Stopping,
    Stopped,
    EmergencyShutdown,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BotState::Uninitialized => "uninitialized",
            BotState::Initializing => "initializing",
            BotState::Ready => "ready",
            BotState::Running => "running",
            BotState::Backoff => "backoff",
            BotState::Stopping => "stopping",
            BotState::Stopped => "stopped",
            BotState::EmergencyShutdown => "emergency_shutdown",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Executed,
    NoOpportunity,
    GasWait,
}

/// Exponential cycle backoff: min(30 s, 2^k).
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    let secs = 2u64.saturating_pow(consecutive_failures.min(10)).min(30);
    Duration::from_secs(secs)
}

/// Candidate order for evaluation: expected profit descending. Net profit
/// is not known before the accountant runs, so the gross edge is the proxy.
pub fn sort_by_expected_profit(candidates: &mut [Opportunity]) {
    candidates.sort_by(|a, b| {
        b.gross_profit_percent
            .partial_cmp(&a.gross_profit_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Adaptive inter-cycle sleep, clamped to [1 s, 30 s].
pub fn cycle_sleep(gas_ratio_of_max: f64, recent_executions: u32) -> Duration {
    let mut secs = BASE_SLEEP.as_secs();
    if gas_ratio_of_max > 0.7 {
        secs += 5;
    }
    if recent_executions >= HEAVY_EXECUTION_COUNT {
        secs += 3;
    }
    Duration::from_secs(secs.clamp(1, 30))
}

/// Owns every component and drives the scan loop.
pub struct Orchestrator {
    config: Config,
    state: RwLock<BotState>,
    is_running: AtomicBool,
    stop_requested: AtomicBool,
    emergency: AtomicBool,
    consecutive_errors: AtomicU32,
    recent_executions: AtomicU32,
    last_summary_hour: AtomicI64,
    registry: Arc<crate::registry::TokenRegistry>,
    zscore: Arc<crate::zscore::ZScoreEngine>,
    scanner: Arc<OpportunityScanner>,
    accountant: Arc<ProfitAccountant>,
    guard: Arc<MevGuard>,
    gas_oracle: Arc<GasOracle>,
    txbuilder: Arc<TxBuilder>,
    pool: Arc<crate::rpc::RpcPool>,
    metrics: Arc<Metrics>,
    alerter: Arc<Alerter>,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        config: Config,
        registry: Arc<crate::registry::TokenRegistry>,
        zscore: Arc<crate::zscore::ZScoreEngine>,
        scanner: Arc<OpportunityScanner>,
        accountant: Arc<ProfitAccountant>,
        guard: Arc<MevGuard>,
        gas_oracle: Arc<GasOracle>,
        txbuilder: Arc<TxBuilder>,
        pool: Arc<crate::rpc::RpcPool>,
        metrics: Arc<Metrics>,
        alerter: Arc<Alerter>,
    ) -> Self {
        Self {
            config,
            state: RwLock::new(BotState::Uninitialized),
            is_running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            recent_executions: AtomicU32::new(0),
            last_summary_hour: AtomicI64::new(-1),
            registry,
            zscore,
            scanner,
            accountant,
            guard,
            gas_oracle,
            txbuilder,
            pool,
            metrics,
            alerter,
        }
    }

    pub async fn state(&self) -> BotState {
        *self.state.read().await
    }

    async fn set_state(&self, next: BotState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!("[ORCH] {} -> {next}", *state);
            *state = next;
        }
    }

    /// Initialization graph: config → registry → pairs → blacklist → nonce
    /// → first gas sample. Refuses to leave Initializing on config errors.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.set_state(BotState::Initializing).await;

        if let Err(e) = self.config.validate() {
            if let EngineError::ConfigInvalid(ref errors) = e {
                for problem in errors {
                    error!("[ORCH] config: {problem}");
                }
            }
            self.alerter.send(
                AlertLevel::Critical,
                "Configuration invalid",
                &e.to_string(),
                json!({}),
            );
            return Err(e);
        }

        self.registry.seed_base_tokens(&self.config).await?;
        match self.zscore.init_pairs(&self.pool).await {
            Ok(n) => info!("[ORCH] pair universe ready ({n} pairs)"),
            Err(e) => warn!("[ORCH] pair discovery degraded: {e}"),
        }
        self.guard.load_blacklist().await;
        self.txbuilder.init_nonce().await?;
        if let Err(e) = self.gas_oracle.sample(&self.pool).await {
            warn!("[ORCH] first gas sample failed: {e}");
        }

        self.set_state(BotState::Ready).await;
        Ok(())
    }

    /// Main loop. Returns when stopped or on emergency shutdown.
    pub async fn run(&self) {
        self.set_state(BotState::Running).await;
        self.is_running.store(true, Ordering::SeqCst);
        let mut failures = 0u32;

        while !self.stop_requested.load(Ordering::SeqCst)
            && !self.emergency.load(Ordering::SeqCst)
        {
            self.maybe_send_hourly_summary().await;

            let started = Instant::now();
            match self.run_cycle().await {
                Ok(outcome) => {
                    failures = 0;
                    if self.state().await == BotState::Backoff {
                        self.set_state(BotState::Running).await;
                    }
                    self.metrics
                        .scan_cycle_time_ms
                        .record(started.elapsed().as_millis() as f64);
                    if outcome == CycleOutcome::GasWait {
                        continue; // the cycle already slept
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.record_cycle_error(&e).await;
                    if self.emergency.load(Ordering::SeqCst) {
                        break;
                    }
                    self.set_state(BotState::Backoff).await;
                    tokio::time::sleep(backoff_delay(failures)).await;
                    continue;
                }
            }

            let gas_ratio = if self.gas_oracle.max_gas_price_gwei() > 0.0 {
                self.metrics.gas_price_gwei() / self.gas_oracle.max_gas_price_gwei()
            } else {
                0.0
            };
            let sleep = cycle_sleep(gas_ratio, self.recent_executions.load(Ordering::SeqCst));
            tokio::time::sleep(sleep).await;
            // executions age out of the heaviness signal one per cycle
            let _ = self.recent_executions.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| Some(n.saturating_sub(1)),
            );
        }

        self.is_running.store(false, Ordering::SeqCst);
        if self.emergency.load(Ordering::SeqCst) {
            self.set_state(BotState::EmergencyShutdown).await;
        } else {
            self.graceful_stop().await;
        }
    }

    /// One cycle of the per-cycle protocol.
    async fn run_cycle(&self) -> Result<CycleOutcome, EngineError> {
        // 1. Network-level gas gate
        let network_gas_usd = self.estimated_network_gas_usd().await;
        let wait = self
            .gas_oracle
            .should_wait_for_better_gas(network_gas_usd, self.config.min_profit_threshold_usd)
            .await;
        if wait.wait {
            let sleep = Duration::from_secs(wait.wait_blocks * 2).min(MAX_GAS_WAIT);
            info!(
                "[ORCH] waiting for gas: {} ({}s)",
                wait.reason.as_deref().unwrap_or("unknown"),
                sleep.as_secs()
            );
            tokio::time::sleep(sleep).await;
            return Ok(CycleOutcome::GasWait);
        }

        // 2. Scan
        let mut candidates = self.scanner.scan().await;
        self.metrics.inc_scanned(candidates.len() as u64);
        if candidates.is_empty() {
            return Ok(CycleOutcome::NoOpportunity);
        }

        // 3. Expected profit descending; the scanner's composite score only
        // ranks within its own search families
        sort_by_expected_profit(&mut candidates);

        // 4–7. Evaluate the top candidates; execute the first that clears
        // every gate.
        for opp in candidates.into_iter().take(TOP_CANDIDATES) {
            match self.evaluate_and_execute(&opp).await {
                Ok(()) => {
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    return Ok(CycleOutcome::Executed);
                }
                Err(e) if e.is_veto() || e.is_recoverable() => {
                    self.metrics.inc_failed();
                    self.alerter.send(
                        AlertLevel::Warning,
                        "OpportunityMissed",
                        &e.veto_reason(),
                        json!({"opportunity_id": opp.id, "kind": opp.kind.to_string()}),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(CycleOutcome::NoOpportunity)
    }

    async fn evaluate_and_execute(&self, opp: &Opportunity) -> Result<(), EngineError> {
        let now = chrono::Utc::now().timestamp();
        if let Err(reason) = opp.validate_shape(now) {
            return Err(EngineError::SimulationFailed(format!("invalid shape: {reason}")));
        }

        // Accountant
        let breakdown = self.accountant.analyze(opp, None).await?;
        if !breakdown.meets_threshold {
            return Err(EngineError::ProfitBelowThreshold {
                net: breakdown.net_profit_usd,
                threshold: self.config.min_profit_threshold_usd,
            });
        }

        // MEV guard
        let network_price = self.gas_oracle.network_price().await;
        let avg_block_time = self.gas_oracle.avg_block_time_secs().await;
        self.guard
            .check_opportunity(opp, network_price, avg_block_time)
            .await?;

        // Per-opportunity gas gate
        let wait = self
            .gas_oracle
            .should_wait_for_better_gas(breakdown.gas_cost_usd, breakdown.gross_profit_usd)
            .await;
        if wait.wait {
            return Err(EngineError::GasTooHigh {
                gwei: wei_to_gwei(network_price),
                max_gwei: self.gas_oracle.max_gas_price_gwei(),
            });
        }

        // Simulation with the real calldata
        let params = self
            .gas_oracle
            .optimal_gas_params(TxComplexity::FlashLoan, TxUrgency::High)
            .await;
        let min_profit = self.min_profit_amount(opp).await;
        let call = SimulationCall {
            from: self.txbuilder.wallet_address(),
            to: self.txbuilder.executor(),
            data: self.txbuilder.arbitrage_calldata(opp, min_profit),
            gas_limit: params.gas_limit.as_u64(),
        };
        let simulated = self
            .accountant
            .simulate(opp, Some(&call), self.config.chain_id)
            .await?;

        // Borderline candidates: when simulation prices the trade worse than
        // the estimate, demand 1.5x the profit floor.
        if simulated.net_profit_usd < breakdown.net_profit_usd
            && simulated.net_profit_usd < 1.5 * self.config.min_profit_threshold_usd
        {
            return Err(EngineError::ProfitBelowThreshold {
                net: simulated.net_profit_usd,
                threshold: 1.5 * self.config.min_profit_threshold_usd,
            });
        }

        if self.config.test_mode {
            info!(
                "[ORCH] TEST_MODE: would execute opp {} (net ${:.2})",
                opp.id, simulated.net_profit_usd
            );
            self.metrics.inc_executed();
            self.guard.record_execution(opp).await;
            return Ok(());
        }

        // Execute
        let exec_started = Instant::now();
        let tx_hash = self
            .txbuilder
            .dispatch(opp, params, params.gas_limit, min_profit)
            .await?;
        info!("[ORCH] executing opp {} via {tx_hash:?}", opp.id);

        let gas_used = self.txbuilder.wait_for_receipt(tx_hash).await?;
        let elapsed_ms = exec_started.elapsed().as_millis() as f64;

        self.metrics.inc_executed();
        self.metrics.opportunity_execution_time_ms.record(elapsed_ms);
        self.metrics.add_profit_usd(simulated.net_profit_usd);
        self.recent_executions.fetch_add(1, Ordering::SeqCst);
        self.guard.record_execution(opp).await;
        self.alerter.send(
            AlertLevel::Success,
            "Arbitrage executed",
            &format!(
                "net ${:.2}, gas ${:.2}, {} hops, {}ms",
                simulated.net_profit_usd,
                simulated.gas_cost_usd,
                opp.hops.len(),
                elapsed_ms as u64
            ),
            json!({
                "tx_hash": format!("{tx_hash:?}"),
                "net_profit_usd": simulated.net_profit_usd,
                "gas_used": gas_used,
            }),
        );
        Ok(())
    }

    /// Flash-loan minimum profit in the loan asset's smallest units.
    async fn min_profit_amount(&self, opp: &Opportunity) -> U256 {
        let Some(asset) = opp.flash_asset() else {
            return U256::zero();
        };
        let price = self.registry.price_usd(asset).await.unwrap_or(0.0);
        let decimals = self.registry.decimals(asset).await.unwrap_or(18);
        if price <= 0.0 {
            return U256::zero();
        }
        amount_from_f64(self.config.min_profit_threshold_usd / price, decimals)
    }

    /// Rough USD cost of one flash-loan transaction at current gas, for the
    /// cycle-level wait gate.
    async fn estimated_network_gas_usd(&self) -> f64 {
        let price = self.gas_oracle.network_price().await;
        let numeraire = self
            .config
            .base_tokens
            .first()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();
        let native = self.registry.price_usd(numeraire).await.unwrap_or(0.0);
        let units = U256::from(1_000_000u64);
        crate::types::amount_to_usd(units * price, 18, native)
    }

    /// Consecutive-error escalation: alert on the first error of a burst,
    /// critical warning near the limit, emergency shutdown at the limit.
    pub async fn record_cycle_error(&self, e: &EngineError) {
        let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.config.max_consecutive_errors;
        warn!("[ORCH] cycle error {count}/{max}: {e}");

        if count == 1 {
            self.alerter.send(
                AlertLevel::Error,
                "Cycle error",
                &e.to_string(),
                json!({"consecutive": count}),
            );
        }
        if count == max.saturating_sub(2) {
            self.alerter.send(
                AlertLevel::Critical,
                "Repeated cycle errors",
                &format!("{count} consecutive errors, {} from shutdown", max - count),
                json!({"consecutive": count}),
            );
        }
        if count >= max {
            self.trigger_emergency_shutdown(&format!("{count} consecutive cycle errors"))
                .await;
        }
    }

    /// Terminal: stop the loop immediately, no further broadcasts.
    pub async fn trigger_emergency_shutdown(&self, reason: &str) {
        error!("[ORCH] EMERGENCY SHUTDOWN: {reason}");
        self.emergency.store(true, Ordering::SeqCst);
        self.is_running.store(false, Ordering::SeqCst);
        self.set_state(BotState::EmergencyShutdown).await;
        self.alerter.send(
            AlertLevel::Critical,
            "Emergency shutdown",
            reason,
            json!({"errors": self.consecutive_errors.load(Ordering::SeqCst)}),
        );
    }

    /// Graceful stop: no new cycles, drain in-flight transactions ≤ 30 s.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    async fn graceful_stop(&self) {
        self.set_state(BotState::Stopping).await;
        let left = self
            .txbuilder
            .drain_pending(Duration::from_secs(SHUTDOWN_DRAIN_SECS))
            .await;
        if left > 0 {
            warn!("[ORCH] stopped with {left} transactions still pending");
        }
        self.set_state(BotState::Stopped).await;
        info!("[ORCH] stopped cleanly");
    }

    /// Hourly summary on the top of each hour.
    async fn maybe_send_hourly_summary(&self) {
        let now = chrono::Utc::now().timestamp();
        let hour = now - now.rem_euclid(3600);
        let last = self.last_summary_hour.swap(hour, Ordering::SeqCst);
        if last == hour || last < 0 {
            return; // same hour, or the boot hour
        }
        self.alerter.send(
            AlertLevel::Info,
            "Hourly summary",
            &format!(
                "scanned {}, executed {}, failed {}, profit ${:.2} (hour) ${:.2} (day)",
                self.metrics.scanned_total(),
                self.metrics.executed_total(),
                self.metrics.failed_total(),
                self.metrics.hourly_profit_usd(),
                self.metrics.daily_profit_usd(),
            ),
            json!({"hour": hour}),
        );
    }
}

// =============================================================================
// TESTS
// =============================================================================
