//! Engine error taxonomy.
//!
//! Every failure the orchestrator has to make a decision about is one of
//! these kinds. Per-opportunity vetoes are recoverable and never fatal;
//! cycle errors feed the consecutive-error counter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Startup configuration problems; carries every issue found at once.
    #[error("invalid configuration: {0:?}")]
    ConfigInvalid(Vec<String>),

    /// All transport endpoints failed for a call.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An external API refused the request budget.
    #[error("rate limited by {0}")]
    RateLimited(String),

    /// No routing source produced a usable quote.
    #[error("no quote available for {0}")]
    QuoteUnavailable(String),

    /// Simulation ran but rejected the opportunity.
    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    /// Net profit below the configured threshold.
    #[error("profit below threshold: net ${net:.2} < ${threshold:.2}")]
    ProfitBelowThreshold { net: f64, threshold: f64 },

    /// Network gas price above the configured ceiling.
    #[error("gas too high: {gwei:.1} gwei > {max_gwei:.1} gwei cap")]
    GasTooHigh { gwei: f64, max_gwei: f64 },

    /// The MEV guard vetoed the opportunity.
    #[error("MEV veto: {0}")]
    MEVVeto(String),

    /// On-chain pending nonce disagrees with the local counter.
    #[error("nonce mismatch: local {local}, chain {chain}")]
    NonceMismatch { local: u64, chain: u64 },

    /// Raw transaction submission failed.
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    /// No receipt within the confirmation window.
    #[error("confirmation timeout for {0}")]
    ConfirmationTimeout(String),

    /// The executor contract reverted.
    #[error("contract reverted: {0}")]
    ContractReverted(String),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Per-opportunity vetoes: logged and counted, never fatal, and they do
    /// not feed the consecutive-error counter.
    pub fn is_veto(&self) -> bool {
        matches!(
            self,
            EngineError::SimulationFailed(_)
                | EngineError::ProfitBelowThreshold { .. }
                | EngineError::GasTooHigh { .. }
                | EngineError::MEVVeto(_)
        )
    }

    /// Cycle errors increment the consecutive-error counter and can escalate
    /// to emergency shutdown.
    pub fn is_cycle_error(&self) -> bool {
        matches!(
            self,
            EngineError::ContractReverted(_)
                | EngineError::BroadcastFailed(_)
                | EngineError::ConfirmationTimeout(_)
                | EngineError::NonceMismatch { .. }
                | EngineError::Internal(_)
        )
    }

    /// Locally recoverable: try the next source/endpoint before surfacing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::TransportUnavailable(_)
                | EngineError::RateLimited(_)
                | EngineError::QuoteUnavailable(_)
        )
    }

    /// Short reason used in missed-opportunity alerts.
    pub fn veto_reason(&self) -> String {
        match self {
            EngineError::MEVVeto(r) => r.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(EngineError::MEVVeto("sandwich".into()).is_veto());
        assert!(EngineError::ProfitBelowThreshold { net: 0.5, threshold: 1.0 }.is_veto());
        assert!(!EngineError::BroadcastFailed("rpc".into()).is_veto());

        assert!(EngineError::ContractReverted("0x".into()).is_cycle_error());
        assert!(EngineError::ConfirmationTimeout("0xabc".into()).is_cycle_error());
        assert!(!EngineError::MEVVeto("x".into()).is_cycle_error());
        assert!(!EngineError::RateLimited("odos".into()).is_cycle_error());

        assert!(EngineError::QuoteUnavailable("WETH->USDC".into()).is_recoverable());
        assert!(!EngineError::Internal("boom".into()).is_recoverable());
    }
}
