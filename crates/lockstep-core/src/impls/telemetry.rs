//! TelemetrySink の実装
//!
//! - **TracingSink**: `tracing` へ転送（デフォルト）
//! - **MemorySink**: テスト用に記録を保持

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::ports::telemetry::{LogLevel, Metadata, TelemetrySink};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_log(&self, level: LogLevel, message: &str, metadata: &Metadata) {
        match level {
            LogLevel::Debug => debug!(?metadata, "{message}"),
            LogLevel::Info => info!(?metadata, "{message}"),
            LogLevel::Warn => warn!(?metadata, "{message}"),
            LogLevel::Error => error!(?metadata, "{message}"),
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        debug!(metric = name, value, "metric");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub metadata: Metadata,
}

/// Keeps every log entry and sums metrics by name.
#[derive(Debug, Default)]
pub struct MemorySink {
    logs: Mutex<Vec<LogEntry>>,
    metrics: Mutex<BTreeMap<String, f64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metric(&self, name: &str) -> f64 {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0.0)
    }
}

impl TelemetrySink for MemorySink {
    fn record_log(&self, level: LogLevel, message: &str, metadata: &Metadata) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEntry {
                level,
                message: message.to_string(),
                metadata: metadata.clone(),
            });
    }

    fn record_metric(&self, name: &str, value: f64) {
        *self
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert(0.0) += value;
    }
}
