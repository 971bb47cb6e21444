//! Logging setup and the failure sink.
//!
//! Diagnostics go through `tracing`. Fatal command failures are also written
//! as structured [`FailureRecord`]s to a [`FailureSink`]; a sink that fails is
//! ignored so that logging never masks the original error.

use crate::config::LogConfig;
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target used for failure records emitted by [`TracingFailureSink`].
pub const FAILURE_TARGET: &str = "mssql_ambient::failures";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once keeps the first subscriber.
pub fn init_tracing(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// A terminal failure, as written to the external log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub message: String,
    /// Connection display name (`server.database`)
    pub connection: String,
    /// Offending command text
    pub command: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        message: impl Into<String>,
        connection: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            connection: connection.into(),
            command: command.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Receiver of failure records.
pub trait FailureSink: Send + Sync {
    fn record(&self, record: &FailureRecord) -> DbResult<()>;
}

/// Emits each record as a JSON payload on the [`FAILURE_TARGET`] target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn record(&self, record: &FailureRecord) -> DbResult<()> {
        let payload = serde_json::to_string(record)
            .map_err(|e| DbError::internal(format!("Failed to serialize failure record: {e}")))?;
        tracing::error!(target: FAILURE_TARGET, record = %payload, "Command failure");
        Ok(())
    }
}

/// Keeps records in memory. Handy for embedding applications and tests.
#[derive(Debug, Default)]
pub struct MemoryFailureSink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl FailureSink for MemoryFailureSink {
    fn record(&self, record: &FailureRecord) -> DbResult<()> {
        self.records
            .lock()
            .map_err(|_| DbError::internal("failure sink lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_record_serializes() {
        let record = FailureRecord::new("deadlock", "sql01.Models", "UPDATE t SET x = 1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["connection"], "sql01.Models");
        assert_eq!(json["command"], "UPDATE t SET x = 1");
        assert!(json["occurred_at"].is_string());
    }

    #[test]
    fn test_memory_sink_keeps_records() {
        let sink = MemoryFailureSink::new();
        sink.record(&FailureRecord::new("a", "b", "c")).unwrap();
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = LogConfig::default();
        init_tracing(&config);
        init_tracing(&config);
        assert!(TracingFailureSink.record(&FailureRecord::new("m", "c", "q")).is_ok());
    }
}
