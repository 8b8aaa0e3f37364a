//! Alert fan-out with per-level cooldowns.
//!
//! Transports (chat, email) are external; the engine only knows an
//! [`AlertSink`]. Duplicate alerts are suppressed per `(level, title,
//! data-hash)` key until the level's cooldown elapses.

use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Alert severity. Cooldowns grow with decreasing urgency so a chatty
/// success path cannot drown a critical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Critical,
    Error,
    Warning,
    Info,
    Success,
}

impl AlertLevel {
    pub fn cooldown(&self) -> Duration {
        match self {
            AlertLevel::Critical => Duration::from_secs(60),
            AlertLevel::Error => Duration::from_secs(300),
            AlertLevel::Warning => Duration::from_secs(900),
            AlertLevel::Info => Duration::from_secs(1800),
            AlertLevel::Success => Duration::from_secs(3600),
        }
    }

}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Critical => write!(f, "CRITICAL"),
            AlertLevel::Error => write!(f, "ERROR"),
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Success => write!(f, "SUCCESS"),
        }
    }
}

/// One alert as handed to sinks.
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
}

/// Outbound transport boundary. The default sink logs through `tracing`;
/// real chat/email transports are wired in by the embedder.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver(&self, alert: &Alert) {
        match alert.level {
            AlertLevel::Critical | AlertLevel::Error => {
                error!("[ALERT] {} | {} | {}", alert.level, alert.title, alert.message)
            }
            AlertLevel::Warning => {
                warn!("[ALERT] {} | {} | {}", alert.level, alert.title, alert.message)
            }
            AlertLevel::Info | AlertLevel::Success => {
                info!("[ALERT] {} | {} | {}", alert.level, alert.title, alert.message)
            }
        }
    }
}

/// Cooldown-gated fan-out over the configured sinks.
pub struct Alerter {
    sinks: Vec<Box<dyn AlertSink>>,
    cooldowns: Mutex<FxHashMap<(u64, u64), Instant>>,
}

impl Alerter {
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self {
            sinks,
            cooldowns: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_log_sink() -> Self {
        Self::new(vec![Box::new(LogSink)])
    }

    /// Fan an alert out to every sink unless an identical one fired within
    /// the level's cooldown. Returns whether the alert was delivered.
    pub fn send(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        data: serde_json::Value,
    ) -> bool {
        self.send_at(level, title, message, data, Instant::now())
    }

    fn send_at(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        data: serde_json::Value,
        now: Instant,
    ) -> bool {
        // Cooldown durations are distinct per level, doubling as the key
        let key = (level.cooldown().as_secs(), alert_key_hash(title, &data));
        {
            let mut cooldowns = self.cooldowns.lock().expect("cooldown lock");
            if let Some(last) = cooldowns.get(&key) {
                if now.duration_since(*last) < level.cooldown() {
                    return false;
                }
            }
            cooldowns.insert(key, now);
        }

        let alert = Alert {
            level,
            title: title.to_string(),
            message: message.to_string(),
            data,
        };
        for sink in &self.sinks {
            sink.deliver(&alert);
        }
        true
    }
}

/// Stable alert dedup key over title and data payload.
fn alert_key_hash(title: &str, data: &serde_json::Value) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    title.hash(&mut hasher);
    data.to_string().hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// TESTS
// =============================================================================
