//! EIP-1559 transaction construction, signing, and dispatch.
//!
//! The signing key lives in process memory only. The nonce counter is
//! exclusively owned here: every dispatch path allocates through it, and a
//! mismatch against the chain's pending count triggers exactly one resync
//! and retry before surfacing as a cycle error.

use ethers::contract::abigen;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::CONFIRMATION_TIMEOUT_SECS;
use crate::error::EngineError;
use crate::gas::{GasOracle, GasParams};
use crate::rpc::RpcPool;
use crate::types::{Opportunity, PendingTx};

/// Receipt poll cadence while a transaction is in flight.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

abigen!(
    IFlashArbExecutor,
    r#"[
        function executeArbitrage(address[] calldata tokens, uint256[] calldata amounts, address[] calldata aggregators, bytes[] calldata swapData, uint256 flashLoanAmount, uint256 minProfit) external
    ]"#
);

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Bytes,
    pub tx_hash: H256,
    pub nonce: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Builder/signer/dispatcher with exclusive nonce ownership.
pub struct TxBuilder {
    wallet: LocalWallet,
    wallet_address: Address,
    executor: Address,
    chain_id: u64,
    pool: Arc<RpcPool>,
    gas_oracle: Arc<GasOracle>,
    nonce: Mutex<Option<u64>>,
    pending: RwLock<FxHashMap<H256, PendingTx>>,
}

impl TxBuilder {
    pub fn new(
        private_key: &str,
        executor: Address,
        chain_id: u64,
        pool: Arc<RpcPool>,
        gas_oracle: Arc<GasOracle>,
    ) -> Result<Self, EngineError> {
        Self::with_address_override(private_key, None, executor, chain_id, pool, gas_oracle)
    }

    /// `wallet_override` substitutes the account used for nonce tracking and
    /// the `from` field (relayed/smart-account setups); signing always uses
    /// the key.
    pub fn with_address_override(
        private_key: &str,
        wallet_override: Option<Address>,
        executor: Address,
        chain_id: u64,
        pool: Arc<RpcPool>,
        gas_oracle: Arc<GasOracle>,
    ) -> Result<Self, EngineError> {
        let wallet: LocalWallet = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|_| EngineError::ConfigInvalid(vec!["invalid private key".to_string()]))?;
        let wallet = wallet.with_chain_id(chain_id);
        let wallet_address = match wallet_override {
            Some(address) => {
                if address != wallet.address() {
                    warn!(
                        "[TX] wallet override {address:?} differs from signer {:?}",
                        wallet.address()
                    );
                }
                address
            }
            None => wallet.address(),
        };
        Ok(Self {
            wallet,
            wallet_address,
            executor,
            chain_id,
            pool,
            gas_oracle,
            nonce: Mutex::new(None),
            pending: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    pub fn executor(&self) -> Address {
        self.executor
    }

    /// Initialize the local counter from the chain's pending count.
    pub async fn init_nonce(&self) -> Result<u64, EngineError> {
        let address = self.wallet_address;
        let count = self
            .pool
            .execute(|provider| async move {
                ethers::providers::Middleware::get_transaction_count(
                    &*provider,
                    address,
                    Some(ethers::types::BlockNumber::Pending.into()),
                )
                .await
            })
            .await?;
        let nonce = count.as_u64();
        *self.nonce.lock().await = Some(nonce);
        info!("[TX] nonce initialized at {nonce} for {address:?}");
        Ok(nonce)
    }

    /// Seed the counter without a chain read (tests, restarts).
    pub async fn seed_nonce(&self, nonce: u64) {
        *self.nonce.lock().await = Some(nonce);
    }

    /// Allocate the next nonce. Monotonic across every dispatch.
    async fn next_nonce(&self) -> Result<u64, EngineError> {
        let mut guard = self.nonce.lock().await;
        let current = guard
            .ok_or_else(|| EngineError::Internal("nonce counter not initialized".into()))?;
        *guard = Some(current + 1);
        Ok(current)
    }

    /// Encoded executor-contract call for an opportunity: the token ring,
    /// exact amounts, per-hop routers, and opaque swap payloads.
    pub fn arbitrage_calldata(&self, opp: &Opportunity, min_profit: U256) -> Bytes {
        let tokens: Vec<Address> = opp.hops.iter().map(|h| h.from_token).collect();
        let amounts: Vec<U256> = opp.hops.iter().map(|h| h.amount_in).collect();
        let aggregators: Vec<Address> = opp
            .hops
            .iter()
            .map(|h| crate::aggregator::source_router(h.source))
            .collect();
        let swap_data: Vec<Bytes> = opp.hops.iter().map(|h| h.payload.clone()).collect();

        let provider = self.pool.endpoint().provider();
        let contract = IFlashArbExecutor::new(self.executor, provider);
        contract
            .execute_arbitrage(tokens, amounts, aggregators, swap_data, opp.amount_in, min_profit)
            .calldata()
            .unwrap_or_default()
    }

    /// Build and sign the arbitrage transaction for one opportunity.
    /// `max_fee_per_gas` never exceeds the oracle's configured ceiling.
    pub async fn build_arbitrage(
        &self,
        opp: &Opportunity,
        params: GasParams,
        gas_limit: U256,
        min_profit: U256,
    ) -> Result<SignedTx, EngineError> {
        let max_fee = params.max_fee_per_gas.min(self.gas_oracle.max_gas_price());
        let priority = params.max_priority_fee_per_gas.min(max_fee);
        let data = self.arbitrage_calldata(opp, min_profit);
        let nonce = self.next_nonce().await?;
        self.sign(self.executor, data, nonce, max_fee, priority, gas_limit).await
    }

    async fn sign(
        &self,
        to: Address,
        data: Bytes,
        nonce: u64,
        max_fee: U256,
        priority: U256,
        gas_limit: U256,
    ) -> Result<SignedTx, EngineError> {
        let request = Eip1559TransactionRequest::new()
            .from(self.wallet_address)
            .to(to)
            .data(data)
            .nonce(nonce)
            .chain_id(self.chain_id)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(priority)
            .gas(gas_limit);
        let typed = TypedTransaction::Eip1559(request);

        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| EngineError::Internal(format!("signing failed: {e}")))?;
        let raw = typed.rlp_signed(&signature);
        let tx_hash = H256::from(keccak256(&raw));

        Ok(SignedTx {
            raw,
            tx_hash,
            nonce,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        })
    }

    /// Same-nonce no-op with fees scaled by `multiplier_bps`/10_000, for
    /// replacing a stuck transaction.
    pub async fn replace(
        &self,
        old_hash: H256,
        multiplier_bps: u64,
    ) -> Result<SignedTx, EngineError> {
        let old = self
            .pending
            .read()
            .await
            .get(&old_hash)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("unknown pending tx {old_hash:?}")))?;

        let scale = U256::from(multiplier_bps.max(10_000));
        let max_fee = (old.max_fee_per_gas * scale / U256::from(10_000u64))
            .min(self.gas_oracle.max_gas_price());
        let priority =
            (old.max_priority_fee_per_gas * scale / U256::from(10_000u64)).min(max_fee);

        let replacement = self
            .sign(
                self.wallet_address,
                Bytes::new(),
                old.nonce,
                max_fee,
                priority,
                U256::from(21_000u64),
            )
            .await?;

        warn!(
            "[TX] replacing {old_hash:?} nonce {} at {}x fees",
            old.nonce,
            multiplier_bps as f64 / 10_000.0
        );
        Ok(replacement)
    }

    /// Submit a signed transaction and start tracking it.
    pub async fn broadcast(
        &self,
        signed: &SignedTx,
        opportunity_id: u64,
    ) -> Result<H256, EngineError> {
        let raw = signed.raw.clone();
        let result = self
            .pool
            .execute(|provider| async move {
                let pending = ethers::providers::Middleware::send_raw_transaction(
                    &*provider, raw,
                )
                .await?;
                Ok(pending.tx_hash())
            })
            .await;

        let tx_hash = match result {
            Ok(hash) => hash,
            Err(EngineError::TransportUnavailable(msg)) => {
                return Err(classify_broadcast_error(&msg));
            }
            Err(e) => return Err(e),
        };

        self.pending.write().await.insert(
            tx_hash,
            PendingTx {
                tx_hash,
                nonce: signed.nonce,
                raw: signed.raw.clone(),
                opportunity_id,
                max_fee_per_gas: signed.max_fee_per_gas,
                max_priority_fee_per_gas: signed.max_priority_fee_per_gas,
                submitted_at: Instant::now(),
            },
        );
        debug!("[TX] broadcast {tx_hash:?} nonce {}", signed.nonce);
        Ok(tx_hash)
    }

    /// Build, sign, and broadcast with single-retry nonce recovery.
    pub async fn dispatch(
        &self,
        opp: &Opportunity,
        params: GasParams,
        gas_limit: U256,
        min_profit: U256,
    ) -> Result<H256, EngineError> {
        let signed = self.build_arbitrage(opp, params, gas_limit, min_profit).await?;
        match self.broadcast(&signed, opp.id).await {
            Ok(hash) => Ok(hash),
            Err(EngineError::NonceMismatch { .. }) => {
                // Re-read pending count and retry exactly once; a second
                // mismatch surfaces as the cycle error
                let chain_nonce = self.init_nonce().await?;
                warn!("[TX] nonce resynced to {chain_nonce}, retrying");
                let signed = self
                    .build_arbitrage(opp, params, gas_limit, min_profit)
                    .await?;
                self.broadcast(&signed, opp.id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Poll for the receipt until confirmation or the 60 s timeout. The
    /// pending entry is dropped either way.
    pub async fn wait_for_receipt(&self, tx_hash: H256) -> Result<u64, EngineError> {
        let deadline = Instant::now() + Duration::from_secs(CONFIRMATION_TIMEOUT_SECS);
        loop {
            if Instant::now() >= deadline {
                self.pending.write().await.remove(&tx_hash);
                return Err(EngineError::ConfirmationTimeout(format!("{tx_hash:?}")));
            }
            let receipt = self
                .pool
                .execute(|provider| async move {
                    ethers::providers::Middleware::get_transaction_receipt(&*provider, tx_hash)
                        .await
                })
                .await;

            match receipt {
                Ok(Some(receipt)) => {
                    self.pending.write().await.remove(&tx_hash);
                    let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                    if success {
                        let gas_used = receipt.gas_used.unwrap_or_default().as_u64();
                        return Ok(gas_used);
                    }
                    return Err(EngineError::ContractReverted(format!("{tx_hash:?}")));
                }
                Ok(None) => {}
                Err(e) => debug!("[TX] receipt poll failed: {e}"),
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Graceful-stop drain: wait for in-flight transactions up to `bound`.
    pub async fn drain_pending(&self, bound: Duration) -> usize {
        let deadline = Instant::now() + bound;
        while Instant::now() < deadline {
            if self.pending.read().await.is_empty() {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let left = self.pending.read().await.len();
        if left > 0 {
            warn!("[TX] {left} transactions still pending after drain window");
        }
        left
    }
}

/// Map a raw broadcast failure onto the taxonomy.
fn classify_broadcast_error(msg: &str) -> EngineError {
    let lower = msg.to_lowercase();
    if lower.contains("nonce") {
        // The chain's view is unknown here; the dispatcher resyncs
        EngineError::NonceMismatch { local: 0, chain: 0 }
    } else if lower.contains("revert") {
        EngineError::ContractReverted(msg.to_string())
    } else {
        EngineError::BroadcastFailed(msg.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::types::test_support::{addr, cycle_opportunity as opportunity};

    // Throwaway test key (well-known Hardhat account #0)
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn builder() -> TxBuilder {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(
            RpcPool::new(&config.rpc_nodes, config.rpc_settings.clone(), metrics.clone()).unwrap(),
        );
        let oracle = Arc::new(GasOracle::new(config.max_gas_price_gwei, metrics));
        TxBuilder::new(TEST_KEY, addr(0xEE), config.chain_id, pool, oracle).unwrap()
    }

    fn params(max_fee_gwei: f64, priority_gwei: f64) -> GasParams {
        GasParams {
            max_fee_per_gas: crate::types::gwei_to_wei(max_fee_gwei),
            max_priority_fee_per_gas: crate::types::gwei_to_wei(priority_gwei),
            gas_limit: U256::from(1_000_000u64),
        }
    }

    #[test]
    fn test_calldata_encodes_path() {
        let b = builder();
        // Hardhat account #0
        assert_eq!(
            b.wallet_address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );

        let opp = opportunity();
        let data = b.arbitrage_calldata(&opp, U256::from(1u64));
        assert!(!data.is_empty());
        // Selector + ABI words; every token address must appear in the blob
        for hop in &opp.hops {
            assert!(
                data.windows(20).any(|w| w == hop.from_token.as_bytes()),
                "token missing from calldata"
            );
        }
    }

    // Nonce monotonicity and the signed-fee ceiling are asserted end to end
    // in tests/integration_tests.rs.

    #[tokio::test]
    async fn test_replace_scales_fees_same_nonce() {
        let b = builder();
        // Building before the nonce counter is initialized is refused
        let early = b
            .build_arbitrage(&opportunity(), params(1.0, 0.5), U256::from(900_000u64), U256::one())
            .await;
        assert!(matches!(early, Err(EngineError::Internal(_))));

        b.seed_nonce(9).await;
        let signed = b
            .build_arbitrage(&opportunity(), params(1.0, 0.5), U256::from(900_000u64), U256::one())
            .await
            .unwrap();

        // Track it as if broadcast succeeded
        b.pending.write().await.insert(
            signed.tx_hash,
            PendingTx {
                tx_hash: signed.tx_hash,
                nonce: signed.nonce,
                raw: signed.raw.clone(),
                opportunity_id: 7,
                max_fee_per_gas: signed.max_fee_per_gas,
                max_priority_fee_per_gas: signed.max_priority_fee_per_gas,
                submitted_at: Instant::now(),
            },
        );

        let replacement = b.replace(signed.tx_hash, 12_000).await.unwrap();
        assert_eq!(replacement.nonce, signed.nonce);
        assert_eq!(
            replacement.max_fee_per_gas,
            signed.max_fee_per_gas * U256::from(12_000u64) / U256::from(10_000u64)
        );
        // Unknown hashes cannot be replaced
        assert!(b.replace(H256::zero(), 11_000).await.is_err());
    }

    #[test]
    fn test_broadcast_error_classification() {
        use EngineError::*;
        assert!(matches!(classify_broadcast_error("nonce too low"), NonceMismatch { .. }));
        assert!(matches!(
            classify_broadcast_error("execution reverted: NoProfit"),
            ContractReverted(_)
        ));
        assert!(matches!(classify_broadcast_error("connection refused"), BroadcastFailed(_)));
    }
}
