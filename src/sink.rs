//! Per-job result and error sinks.
//!
//! The dispatcher hands every finished job to an [`OutputSink`] and every
//! failed job additionally to an [`ErrorSink`]. Sink failures are logged by
//! the dispatcher and never stop a run.
//!
//! Provided sinks:
//! - [`JsonlErrorSink`]: appends one JSON line per failed input (`errors.jsonl`)
//! - [`JsonlResultSink`]: appends one JSON line per finished input
//! - [`MemorySink`]: keeps both streams in memory

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{FailureKind, LlmError};
use crate::traits::CompletionResult;

/// Failure of one input, as written to the error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub input_id: String,
    pub failure_kind: FailureKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(input_id: impl Into<String>, error: &LlmError) -> Self {
        Self {
            input_id: input_id.into(),
            failure_kind: error.kind(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Record for a failed result, `None` on success.
    pub fn from_result(input_id: &str, result: &CompletionResult) -> Option<Self> {
        result.error().map(|e| Self::new(input_id, e))
    }
}

/// One finished input, as written by [`JsonlResultSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultLine {
    pub input_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
}

impl ResultLine {
    pub fn new(input_id: &str, result: &CompletionResult) -> Self {
        Self {
            input_id: input_id.to_string(),
            provider: result.provider.clone(),
            model: result.model.clone(),
            success: result.is_success(),
            payload: result.payload().cloned(),
            failure_kind: result.failure_kind(),
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            latency_ms: result.latency.as_millis().min(u64::MAX as u128) as u64,
        }
    }
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write_result(&self, input_id: &str, result: &CompletionResult) -> io::Result<()>;
}

#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn write_error(&self, record: &ErrorRecord) -> io::Result<()>;
}

/// Append-only JSON-lines file. Writes are serialized by a lock.
#[derive(Debug)]
struct JsonlFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn append<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let mut line = serde_json::to_string(value).map_err(io::Error::other)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// Error log in JSON-lines format (`errors.jsonl`).
#[derive(Debug)]
pub struct JsonlErrorSink {
    file: JsonlFile,
}

impl JsonlErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonlFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

#[async_trait]
impl ErrorSink for JsonlErrorSink {
    async fn write_error(&self, record: &ErrorRecord) -> io::Result<()> {
        self.file.append(record).await
    }
}

/// Result log in JSON-lines format.
#[derive(Debug)]
pub struct JsonlResultSink {
    file: JsonlFile,
}

impl JsonlResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonlFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

#[async_trait]
impl OutputSink for JsonlResultSink {
    async fn write_result(&self, input_id: &str, result: &CompletionResult) -> io::Result<()> {
        self.file.append(&ResultLine::new(input_id, result)).await
    }
}

/// Collects results and error records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<(String, CompletionResult)>>,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results in delivery (completion) order.
    pub async fn results(&self) -> Vec<(String, CompletionResult)> {
        self.results.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().await.clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write_result(&self, input_id: &str, result: &CompletionResult) -> io::Result<()> {
        self.results
            .lock()
            .await
            .push((input_id.to_string(), result.clone()));
        Ok(())
    }
}

#[async_trait]
impl ErrorSink for MemorySink {
    async fn write_error(&self, record: &ErrorRecord) -> io::Result<()> {
        self.errors.lock().await.push(record.clone());
        Ok(())
    }
}
