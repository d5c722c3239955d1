//! TelemetrySink port - ログ・メトリクス記録の抽象化
//!
//! The narrow interface a persistence backend consumes. The core never couples
//! to a schema beyond `record_log` / `record_metric`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

pub type Metadata = BTreeMap<String, String>;

/// TelemetrySink はログとメトリクスを記録
///
/// Implementations must not block; they are called from registry bookkeeping.
pub trait TelemetrySink: Send + Sync {
    fn record_log(&self, level: LogLevel, message: &str, metadata: &Metadata);

    fn record_metric(&self, name: &str, value: f64);
}
