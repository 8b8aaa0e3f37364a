//! In-memory counters, gauges, and histograms with a text-file exporter.
//!
//! Counters are plain atomics shared through `Arc<Metrics>`; a dedicated
//! exporter task owns the output file and rewrites it on a fixed cadence, so
//! hot paths never touch the filesystem.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::METRICS_EXPORT_INTERVAL_SECS;

/// Bounded sample buffer per histogram.
const HISTOGRAM_CAPACITY: usize = 512;

/// Micro-USD fixed point for atomic profit accounting.
const MICRO: f64 = 1_000_000.0;

/// A small bounded histogram: running count/sum plus a recent-sample window
/// for percentile estimates.
pub struct Histogram {
    count: AtomicU64,
    sum_micro: AtomicU64,
    samples: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_micro: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(HISTOGRAM_CAPACITY)),
        }
    }

    pub fn record(&self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micro.fetch_add((value * MICRO) as u64, Ordering::Relaxed);
        let mut samples = self.samples.lock().expect("histogram lock");
        if samples.len() == HISTOGRAM_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micro.load(Ordering::Relaxed) as f64 / MICRO
    }

    /// Percentile over the recent window; 0.0 when empty.
    pub fn percentile(&self, p: f64) -> f64 {
        let samples = self.samples.lock().expect("histogram lock");
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite samples"));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx]
    }
}

/// Rolling profit windows with hourly/daily rollover.
struct ProfitWindows {
    hourly_usd: f64,
    daily_usd: f64,
    hour_start: i64,
    day_start: i64,
}

/// Engine-wide metrics surface.
pub struct Metrics {
    opportunities_scanned: AtomicU64,
    opportunities_executed: AtomicU64,
    opportunities_failed: AtomicU64,
    rpc_requests: AtomicU64,
    rpc_errors: AtomicU64,
    total_profit_micro_usd: AtomicI64,
    gas_price_milli_gwei: AtomicU64,
    windows: Mutex<ProfitWindows>,
    pub scan_cycle_time_ms: Histogram,
    pub opportunity_execution_time_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            opportunities_scanned: AtomicU64::new(0),
            opportunities_executed: AtomicU64::new(0),
            opportunities_failed: AtomicU64::new(0),
            rpc_requests: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
            total_profit_micro_usd: AtomicI64::new(0),
            gas_price_milli_gwei: AtomicU64::new(0),
            windows: Mutex::new(ProfitWindows {
                hourly_usd: 0.0,
                daily_usd: 0.0,
                hour_start: now - now.rem_euclid(3600),
                day_start: now - now.rem_euclid(86_400),
            }),
            scan_cycle_time_ms: Histogram::new(),
            opportunity_execution_time_ms: Histogram::new(),
        }
    }

    pub fn inc_scanned(&self, n: u64) {
        self.opportunities_scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.opportunities_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.opportunities_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rpc_requests(&self) {
        self.rpc_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rpc_errors(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gas_price_gwei(&self, gwei: f64) {
        self.gas_price_milli_gwei
            .store((gwei.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn gas_price_gwei(&self) -> f64 {
        self.gas_price_milli_gwei.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Record realized profit and roll the hourly/daily windows.
    pub fn add_profit_usd(&self, usd: f64) {
        self.add_profit_usd_at(usd, chrono::Utc::now().timestamp());
    }

    fn add_profit_usd_at(&self, usd: f64, now: i64) {
        self.total_profit_micro_usd
            .fetch_add((usd * MICRO) as i64, Ordering::Relaxed);
        let mut w = self.windows.lock().expect("windows lock");
        if now - w.hour_start >= 3600 {
            w.hourly_usd = 0.0;
            w.hour_start = now - now.rem_euclid(3600);
        }
        if now - w.day_start >= 86_400 {
            w.daily_usd = 0.0;
            w.day_start = now - now.rem_euclid(86_400);
        }
        w.hourly_usd += usd;
        w.daily_usd += usd;
    }

    pub fn total_profit_usd(&self) -> f64 {
        self.total_profit_micro_usd.load(Ordering::Relaxed) as f64 / MICRO
    }

    pub fn hourly_profit_usd(&self) -> f64 {
        self.windows.lock().expect("windows lock").hourly_usd
    }

    pub fn daily_profit_usd(&self) -> f64 {
        self.windows.lock().expect("windows lock").daily_usd
    }

    pub fn scanned_total(&self) -> u64 {
        self.opportunities_scanned.load(Ordering::Relaxed)
    }

    pub fn executed_total(&self) -> u64 {
        self.opportunities_executed.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.opportunities_failed.load(Ordering::Relaxed)
    }

    /// Render the full surface as counter/gauge text lines.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(768);
        let mut line = |key: &str, value: String| {
            out.push_str(key);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        };

        line("opportunities_scanned_total", self.scanned_total().to_string());
        line("opportunities_executed_total", self.executed_total().to_string());
        line("opportunities_failed_total", self.failed_total().to_string());
        line("total_profit_usd", format!("{:.6}", self.total_profit_usd()));
        line("daily_profit_usd", format!("{:.6}", self.daily_profit_usd()));
        line("hourly_profit_usd", format!("{:.6}", self.hourly_profit_usd()));
        line("rpc_requests_total", self.rpc_requests.load(Ordering::Relaxed).to_string());
        line("rpc_errors_total", self.rpc_errors.load(Ordering::Relaxed).to_string());
        line("gas_price_gwei", format!("{:.3}", self.gas_price_gwei()));

        for (name, hist) in [
            ("scan_cycle_time_ms", &self.scan_cycle_time_ms),
            ("opportunity_execution_time_ms", &self.opportunity_execution_time_ms),
        ] {
            line(&format!("{name}_count"), hist.count().to_string());
            line(&format!("{name}_sum"), format!("{:.3}", hist.sum()));
            line(&format!("{name}_p50"), format!("{:.3}", hist.percentile(0.50)));
            line(&format!("{name}_p95"), format!("{:.3}", hist.percentile(0.95)));
        }

        out
    }
}

/// Exporter task: rewrites the metrics file every 30 s until the metrics
/// handle is dropped by every other task.
pub async fn run_metrics_exporter(metrics: std::sync::Arc<Metrics>, path: String) {
    info!("[METRICS] exporter started, writing {path}");
    let mut interval = tokio::time::interval(Duration::from_secs(METRICS_EXPORT_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let body = metrics.render();
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!("[METRICS] failed to write {path}: {e}");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_windows_rollover() {
        let m = Metrics::new();
        let t0 = 1_700_000_000i64;
        let t0 = t0 - t0.rem_euclid(86_400); // align to a day boundary

        m.add_profit_usd_at(10.0, t0);
        m.add_profit_usd_at(5.0, t0 + 60);
        assert!((m.hourly_profit_usd() - 15.0).abs() < 1e-9);
        // Next hour: hourly resets, daily keeps accumulating
        m.add_profit_usd_at(2.0, t0 + 3700);
        assert!((m.hourly_profit_usd() - 2.0).abs() < 1e-9);
        assert!((m.daily_profit_usd() - 17.0).abs() < 1e-9);
        // Next day: both reset; the total never does
        m.add_profit_usd_at(1.0, t0 + 86_500);
        assert!((m.daily_profit_usd() - 1.0).abs() < 1e-9);
        assert!((m.total_profit_usd() - 18.0).abs() < 1e-6);
    }

    #[test]
    fn test_histogram_behavior() {
        let h = Histogram::new();
        // Garbage never lands
        h.record(f64::NAN);
        h.record(-1.0);
        assert_eq!(h.count(), 0);

        for v in 1..=100 {
            h.record(v as f64);
        }
        assert_eq!(h.count(), 100);
        assert!((h.sum() - 5050.0).abs() < 1e-3);
        assert!((h.percentile(0.50) - 50.0).abs() <= 1.0);
        assert!((h.percentile(0.95) - 95.0).abs() <= 1.0);

        // Window stays bounded while count keeps the true total
        for v in 0..HISTOGRAM_CAPACITY {
            h.record(v as f64);
        }
        assert_eq!(h.count() as usize, HISTOGRAM_CAPACITY + 100);
        assert_eq!(h.samples.lock().unwrap().len(), HISTOGRAM_CAPACITY);
    }

    #[test]
    fn test_render_contains_all_keys() {
        let m = Metrics::new();
        m.inc_scanned(8);
        m.inc_executed();
        m.inc_failed();
        m.inc_rpc_requests();
        m.inc_rpc_errors();
        m.set_gas_price_gwei(0.42);
        m.scan_cycle_time_ms.record(12.5);
        let body = m.render();

        for key in [
            "opportunities_scanned_total 8",
            "opportunities_executed_total 1",
            "opportunities_failed_total 1",
            "total_profit_usd",
            "daily_profit_usd",
            "hourly_profit_usd",
            "rpc_requests_total 1",
            "rpc_errors_total 1",
            "gas_price_gwei 0.420",
            "scan_cycle_time_ms_count 1",
            "scan_cycle_time_ms_p95",
            "opportunity_execution_time_ms_count 0",
        ] {
            assert!(body.contains(key), "missing {key} in:\n{body}");
        }
    }
}
