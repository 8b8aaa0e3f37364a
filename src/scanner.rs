//! Candidate search: statistical round-trips, triangular paths, and
//! bounded multi-hop cycles.
//!
//! The scanner only proposes; the accountant, guard, and simulator decide.
//! Every candidate is a closed cycle on a flash-loan-eligible asset. Path
//! exploration runs on cheap registry price estimates and only survivors are
//! re-priced with real routes.

use ethers::types::{Address, U256};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregator::AggregatorClient;
use crate::registry::TokenRegistry;
use crate::types::{
    amount_from_f64, amount_to_f64, apply_slippage, Hop, Opportunity, OpportunityKind, RouteQuote,
    ZScoreSnapshot,
};
use crate::zscore::{TradeSignal, ZScoreEngine};

/// Tokens drawn for triangular tripling.
const TRIANGULAR_TOP_K: usize = 5;

/// Branching factor cap in the multi-hop search.
const MAX_NEIGHBORS: usize = 5;

/// Checked-path budget per scan cycle.
const PATH_BUDGET: usize = 100;

/// Survivors re-priced per starting token.
const TOP_PATHS_PER_TOKEN: usize = 10;

/// Hard ceiling on statistical position notional.
const MAX_STAT_NOTIONAL_USD: f64 = 10_000.0;

/// Base statistical notional before the deviation multiplier.
const BASE_STAT_NOTIONAL_USD: f64 = 2_500.0;

/// Candidates below this raw edge are discarded (percent).
const MIN_PROFIT_PERCENT: f64 = 0.05;

/// Seconds a candidate stays executable.
const CANDIDATE_DEADLINE_SECS: i64 = 30;

/// Composite ranking score.
pub fn score_opportunity(
    profit_percent: f64,
    zscore_abs: f64,
    confidence: f64,
    path_liquidity_usd: f64,
    total_price_impact: f64,
) -> f64 {
    let mut score = 10.0 * profit_percent + 5.0 * zscore_abs;
    if confidence >= 0.8 {
        score += 20.0;
    } else if confidence >= 0.6 {
        score += 10.0;
    }
    if path_liquidity_usd > 1.0 {
        score += 5.0 * path_liquidity_usd.log10();
    }
    score - 100.0 * total_price_impact
}

/// Position notional for a statistical signal: scales with the deviation
/// beyond entry, hard-capped at $10K.
pub fn statistical_notional_usd(zscore_abs: f64, entry_threshold: f64) -> f64 {
    let excess = (zscore_abs - entry_threshold).max(0.0);
    let scaled = BASE_STAT_NOTIONAL_USD * (1.0 + 0.5 * excess);
    scaled.min(MAX_STAT_NOTIONAL_USD)
}

/// Bounded DFS over estimated unit rates. Pure: rates and adjacency come
/// from the caller; `budget` is shared across starting tokens.
pub(crate) fn find_profitable_cycles(
    rates: &FxHashMap<(Address, Address), f64>,
    neighbors: &FxHashMap<Address, Vec<Address>>,
    start: Address,
    max_hops: usize,
    budget: &mut usize,
) -> Vec<(Vec<Address>, f64)> {
    let mut found = Vec::new();
    let mut path = vec![start];
    dfs(rates, neighbors, start, start, 1.0, max_hops, budget, &mut path, &mut found);
    found.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    found.truncate(TOP_PATHS_PER_TOKEN);
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    rates: &FxHashMap<(Address, Address), f64>,
    neighbors: &FxHashMap<Address, Vec<Address>>,
    start: Address,
    current: Address,
    product: f64,
    hops_left: usize,
    budget: &mut usize,
    path: &mut Vec<Address>,
    found: &mut Vec<(Vec<Address>, f64)>,
) {
    if hops_left == 0 || *budget == 0 {
        return;
    }
    let Some(nexts) = neighbors.get(&current) else {
        return;
    };
    for &next in nexts.iter().take(MAX_NEIGHBORS) {
        if *budget == 0 {
            return;
        }
        let Some(rate) = rates.get(&(current, next)) else {
            continue;
        };
        let extended = product * rate;

        if next == start {
            *budget -= 1;
            if extended > 1.0 && path.len() >= 2 {
                let mut cycle = path.clone();
                cycle.push(start);
                found.push((cycle, extended));
            }
            continue;
        }
        if path.contains(&next) {
            continue;
        }
        *budget -= 1;
        path.push(next);
        dfs(rates, neighbors, start, next, extended, hops_left - 1, budget, path, found);
        path.pop();
    }
}

/// Combines the three candidate families each cycle.
pub struct OpportunityScanner {
    registry: Arc<TokenRegistry>,
    aggregator: Arc<AggregatorClient>,
    zscore: Arc<ZScoreEngine>,
    base_tokens: Vec<Address>,
    max_hops: usize,
    next_id: AtomicU64,
}

impl OpportunityScanner {
    pub fn new(
        registry: Arc<TokenRegistry>,
        aggregator: Arc<AggregatorClient>,
        zscore: Arc<ZScoreEngine>,
        base_tokens: Vec<Address>,
        max_hops: usize,
    ) -> Self {
        Self {
            registry,
            aggregator,
            zscore,
            base_tokens,
            max_hops,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn deadline(&self) -> i64 {
        chrono::Utc::now().timestamp() + CANDIDATE_DEADLINE_SECS
    }

    /// One full scan: union of the three families, ranked by score.
    pub async fn scan(&self) -> Vec<Opportunity> {
        let mut candidates = Vec::new();
        candidates.extend(self.scan_statistical().await);
        candidates.extend(self.scan_triangular().await);
        candidates.extend(self.scan_multi_hop().await);

        candidates.retain(|opp| opp.gross_profit_percent > MIN_PROFIT_PERCENT);
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        info!("[SCAN] {} candidates after filters", candidates.len());
        candidates
    }

    /// Round-trip a chained pair of best quotes into an opportunity.
    async fn round_trip(
        &self,
        kind: OpportunityKind,
        flash: Address,
        via: &[Address],
        amount_in: U256,
        zscore: Option<ZScoreSnapshot>,
    ) -> Option<Opportunity> {
        let mut hops = Vec::with_capacity(via.len() + 1);
        let mut liquidity = 0.0;
        let mut amount = amount_in;
        let mut from = flash;

        for &to in via.iter().chain(std::iter::once(&flash)) {
            let quote = self.aggregator.best_quote(from, to, amount).await.ok()?;
            liquidity += self.registry.liquidity_usd(to).await;
            hops.push(self.hop_from_quote(from, to, amount, &quote));
            amount = quote.return_amount;
            from = to;
        }

        let decimals = self.registry.decimals(flash).await.unwrap_or(18);
        let input = amount_to_f64(amount_in, decimals);
        let output = amount_to_f64(amount, decimals);
        if input <= 0.0 {
            return None;
        }
        let gross_profit_percent = (output - input) / input * 100.0;

        let total_impact: f64 = hops.iter().map(|h| h.price_impact).sum();
        let (z_abs, confidence) = zscore
            .map(|z| (z.zscore.abs(), z.confidence))
            .unwrap_or((0.0, 0.0));
        let score = score_opportunity(
            gross_profit_percent,
            z_abs,
            confidence,
            liquidity,
            total_impact,
        );

        Some(Opportunity {
            id: self.next_id(),
            kind,
            hops,
            amount_in,
            expected_out: amount,
            gross_profit_percent,
            deadline: self.deadline(),
            zscore,
            score,
            path_liquidity_usd: liquidity,
        })
    }

    fn hop_from_quote(
        &self,
        from: Address,
        to: Address,
        amount_in: U256,
        quote: &RouteQuote,
    ) -> Hop {
        Hop {
            from_token: from,
            to_token: to,
            amount_in,
            min_amount_out: apply_slippage(quote.return_amount, quote.source.base_slippage()),
            source: quote.source,
            payload: quote.provider_payload.clone(),
            gas_estimate: quote.gas_estimate,
            price_impact: quote.price_impact,
        }
    }

    /// Statistical family: cointegrated pairs whose |z| cleared entry.
    async fn scan_statistical(&self) -> Vec<Opportunity> {
        let mut out = Vec::new();
        for (pair, _stats) in self.zscore.cointegrated_pairs().await {
            let Some(sig) = self.zscore.signal(&pair).await else {
                continue;
            };
            let (flash, via) = match sig.signal {
                // Overvalued leg is sold first when it is flash-eligible
                TradeSignal::ShortALongB => (pair.token_a, pair.token_b),
                TradeSignal::LongAShortB => (pair.token_b, pair.token_a),
                TradeSignal::ClosePosition | TradeSignal::Hold => continue,
            };
            let (flash, via) = if self.base_tokens.contains(&flash) {
                (flash, via)
            } else if self.base_tokens.contains(&via) {
                (via, flash)
            } else {
                continue;
            };

            let Some(price) = self.registry.price_usd(flash).await else {
                continue;
            };
            let decimals = self.registry.decimals(flash).await.unwrap_or(18);
            let notional =
                statistical_notional_usd(sig.zscore.abs(), self.zscore.entry_threshold());
            let amount_in = amount_from_f64(notional / price, decimals);
            if amount_in.is_zero() {
                continue;
            }

            let snapshot = ZScoreSnapshot {
                zscore: sig.zscore,
                confidence: sig.confidence,
                half_life: sig.stats.half_life,
                hurst_exponent: sig.stats.hurst_exponent,
            };
            if let Some(opp) = self
                .round_trip(
                    OpportunityKind::Statistical,
                    flash,
                    &[via],
                    amount_in,
                    Some(snapshot),
                )
                .await
            {
                debug!(
                    "[SCAN] statistical {:?}/{:?} z={:.2} gross {:.3}%",
                    pair.token_a, pair.token_b, sig.zscore, opp.gross_profit_percent
                );
                out.push(opp);
            }
        }
        out
    }

    /// Triangular family: base → A → B → base over the liquidity top-K.
    async fn scan_triangular(&self) -> Vec<Opportunity> {
        let mut out = Vec::new();
        let top: Vec<Address> = self
            .registry
            .top_by_liquidity(TRIANGULAR_TOP_K)
            .await
            .into_iter()
            .map(|t| t.address)
            .collect();

        for &base in &self.base_tokens {
            let decimals = self.registry.decimals(base).await.unwrap_or(18);
            let one = U256::exp10(decimals as usize);

            for &a in &top {
                for &b in &top {
                    if a == b || a == base || b == base {
                        continue;
                    }
                    if let Some(opp) = self
                        .round_trip(OpportunityKind::Triangular, base, &[a, b], one, None)
                        .await
                    {
                        if opp.expected_out > opp.amount_in {
                            out.push(opp);
                        }
                    }
                }
            }
        }
        out
    }

    /// Multi-hop family: bounded DFS on estimated rates, survivors re-priced
    /// with real routes.
    async fn scan_multi_hop(&self) -> Vec<Opportunity> {
        let (rates, neighbors) = self.build_rate_graph().await;
        let mut budget = PATH_BUDGET;
        let mut out = Vec::new();

        for &base in &self.base_tokens {
            let cycles =
                find_profitable_cycles(&rates, &neighbors, base, self.max_hops, &mut budget);
            let decimals = self.registry.decimals(base).await.unwrap_or(18);
            let one = U256::exp10(decimals as usize);

            for (path, estimate) in cycles {
                // path = [base, t1, ..., base]; the interior is the via list
                let via = &path[1..path.len() - 1];
                if via.is_empty() {
                    continue;
                }
                if let Some(opp) = self
                    .round_trip(OpportunityKind::MultiHop, base, via, one, None)
                    .await
                {
                    if opp.expected_out > opp.amount_in {
                        debug!(
                            "[SCAN] multi-hop {} hops, est {:.4}, real {:.3}%",
                            opp.hops.len(),
                            estimate,
                            opp.gross_profit_percent
                        );
                        out.push(opp);
                    }
                }
            }
        }
        out
    }

    /// Unit-value rates between the liquid token set: each directed edge is
    /// priced by quoting one whole token through the first direct router.
    /// Survivor paths are re-priced with real best routes afterwards.
    async fn build_rate_graph(
        &self,
    ) -> (FxHashMap<(Address, Address), f64>, FxHashMap<Address, Vec<Address>>) {
        let mut universe: Vec<Address> = self.base_tokens.clone();
        for token in self.registry.top_by_liquidity(MAX_NEIGHBORS * 2).await {
            if !universe.contains(&token.address) {
                universe.push(token.address);
            }
        }

        let mut prices = FxHashMap::default();
        let mut decimals = FxHashMap::default();
        for &token in &universe {
            if let (Some(price), Some(dec)) = (
                self.registry.price_usd(token).await,
                self.registry.decimals(token).await,
            ) {
                prices.insert(token, price);
                decimals.insert(token, dec);
            }
        }

        let edge_source = self
            .aggregator
            .sources()
            .iter()
            .copied()
            .find(|s| matches!(s, crate::types::RouteSource::Dex(_)));

        let mut rates = FxHashMap::default();
        let mut neighbors: FxHashMap<Address, Vec<Address>> = FxHashMap::default();
        for &from in &universe {
            if !prices.contains_key(&from) {
                continue;
            }
            let mut ranked: Vec<Address> = universe
                .iter()
                .copied()
                .filter(|t| *t != from && prices.contains_key(t))
                .collect();
            // Universe is already liquidity-ordered after the base tokens
            ranked.truncate(MAX_NEIGHBORS);

            if let Some(source) = edge_source {
                let one = U256::exp10(decimals[&from] as usize);
                for &to in &ranked {
                    let Ok(quote) = self
                        .aggregator
                        .quote(source, from, to, one, Default::default())
                        .await
                    else {
                        continue;
                    };
                    let value_in = amount_to_f64(one, decimals[&from]) * prices[&from];
                    let value_out =
                        amount_to_f64(quote.return_amount, decimals[&to]) * prices[&to];
                    if value_in > 0.0 && value_out > 0.0 {
                        rates.insert((from, to), value_out / value_in);
                    }
                }
            }
            neighbors.insert(from, ranked);
        }
        (rates, neighbors)
    }
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

    #[test]
    fn test_score_components() {
        // Conviction bonuses: +10 at 0.6 confidence, +20 at 0.8
        let none = score_opportunity(0.5, 2.4, 0.5, 1_000_000.0, 0.001);
        let medium = score_opportunity(0.5, 2.4, 0.65, 1_000_000.0, 0.001);
        let high = score_opportunity(0.5, 2.4, 0.85, 1_000_000.0, 0.001);
        assert!((medium - none - 10.0).abs() < 1e-9);
        assert!((high - none - 20.0).abs() < 1e-9);
        // Impact penalty is 100x linear
        let clean = score_opportunity(0.5, 0.0, 0.0, 1_000_000.0, 0.001);
        let heavy = score_opportunity(0.5, 0.0, 0.0, 1_000_000.0, 0.05);
        assert!((clean - heavy - 100.0 * (0.05 - 0.001)).abs() < 1e-9);
        // Liquidity bonus is 5 per decade
        let thin = score_opportunity(0.5, 0.0, 0.0, 10_000.0, 0.001);
        let deep = score_opportunity(0.5, 0.0, 0.0, 10_000_000.0, 0.001);
        assert!((deep - thin - 15.0).abs() < 1e-9);

        // Statistical sizing scales with the deviation past entry,
        // hard-capped at $10K
        assert_eq!(statistical_notional_usd(2.0, 2.0), BASE_STAT_NOTIONAL_USD);
        assert!((statistical_notional_usd(3.0, 2.0) - BASE_STAT_NOTIONAL_USD * 1.5).abs() < 1e-9);
        assert_eq!(statistical_notional_usd(50.0, 2.0), MAX_STAT_NOTIONAL_USD);
    }

    // =========================================================================
    // Multi-hop DFS
    // =========================================================================

    fn graph(
        edges: &[(u8, u8, f64)],
    ) -> (FxHashMap<(Address, Address), f64>, FxHashMap<Address, Vec<Address>>) {
        let mut rates = FxHashMap::default();
        let mut neighbors: FxHashMap<Address, Vec<Address>> = FxHashMap::default();
        for &(from, to, rate) in edges {
            rates.insert((addr(from), addr(to)), rate);
            neighbors.entry(addr(from)).or_default().push(addr(to));
        }
        (rates, neighbors)
    }

    #[test]
    fn test_dfs_finds_profitable_cycles_only() {
        let (rates, neighbors) = graph(&[
            (1, 2, 1.01),
            (2, 3, 1.01),
            (3, 1, 1.01),
            (2, 1, 0.95),
            (3, 2, 0.95),
        ]);
        let mut budget = PATH_BUDGET;
        let cycles = find_profitable_cycles(&rates, &neighbors, addr(1), 4, &mut budget);
        let (path, product) = &cycles[0];
        assert!(*product > 1.0);
        assert_eq!(path, &vec![addr(1), addr(2), addr(3), addr(1)]);

        // A losing 2-cycle never surfaces
        let (rates, neighbors) = graph(&[(1, 2, 0.99), (2, 1, 0.99)]);
        let mut budget = PATH_BUDGET;
        assert!(find_profitable_cycles(&rates, &neighbors, addr(1), 4, &mut budget).is_empty());

        // Profit requiring 4 hops is invisible at a 3-hop limit
        let (rates, neighbors) = graph(&[(1, 2, 1.0), (2, 3, 1.0), (3, 4, 1.0), (4, 1, 1.5)]);
        let mut budget = PATH_BUDGET;
        assert!(find_profitable_cycles(&rates, &neighbors, addr(1), 3, &mut budget).is_empty());
        let mut budget = PATH_BUDGET;
        assert_eq!(find_profitable_cycles(&rates, &neighbors, addr(1), 4, &mut budget).len(), 1);
    }

    #[test]
    fn test_dfs_bounded() {
        // Dense graph: the shared path budget stops the walk
        let mut edges = Vec::new();
        for from in 1..=6u8 {
            for to in 1..=6u8 {
                if from != to {
                    edges.push((from, to, 1.001));
                }
            }
        }
        let (rates, neighbors) = graph(&edges);
        let mut budget = 10usize;
        let _ = find_profitable_cycles(&rates, &neighbors, addr(1), 6, &mut budget);
        assert_eq!(budget, 0);

        // Many profitable 2-cycles: survivors capped per starting token
        let mut edges = Vec::new();
        for to in 2..=30u8 {
            edges.push((1, to, 1.05));
            edges.push((to, 1, 1.0));
        }
        let (rates, neighbors) = graph(&edges);
        let mut budget = 10_000usize;
        let cycles = find_profitable_cycles(&rates, &neighbors, addr(1), 4, &mut budget);
        assert!(cycles.len() <= TOP_PATHS_PER_TOKEN);

        // Interior tokens are never revisited even when a sub-loop profits
        let (rates, neighbors) =
            graph(&[(1, 2, 1.1), (2, 3, 1.1), (3, 2, 1.1), (3, 1, 1.1)]);
        let mut budget = PATH_BUDGET;
        for (path, _) in find_profitable_cycles(&rates, &neighbors, addr(1), 6, &mut budget) {
            let interior = &path[1..path.len() - 1];
            let mut seen = interior.to_vec();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), interior.len(), "interior revisit in {path:?}");
        }
    }
}
