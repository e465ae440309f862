//! Bounded concurrent dispatch of extraction jobs.
//!
//! The dispatcher keeps at most `workers` jobs in flight on a
//! [`tokio::task::JoinSet`], refilling as jobs finish. Results reach the
//! sinks in completion order, not submission order. A failing or panicking
//! job never stops the others, and every submitted job yields exactly one
//! result unless a stop was requested before it was scheduled.
//!
//! # Cancellation
//!
//! Raising the [`StopSignal`] stops scheduling: jobs already in flight finish
//! their current attempt (no further retries or fallback links), and jobs not
//! yet scheduled are reported in [`RunSummary::skipped`]. Aborting an attempt
//! mid-request is not supported.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::LlmError;
use crate::fallback::{ChainStatus, FallbackChain, FallbackOrchestrator};
use crate::model_config::{MAX_WORKERS, MIN_WORKERS};
use crate::sink::{ErrorRecord, ErrorSink, OutputSink};
use crate::traits::{CompletionRequest, CompletionResult};

/// Default number of concurrent jobs.
pub const DEFAULT_WORKERS: usize = 5;

/// Run-level stop request shared by the dispatcher and its jobs.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One input document and the request to run for it.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub input_id: String,
    pub request: CompletionRequest,
}

impl ExtractionJob {
    pub fn new(input_id: impl Into<String>, request: CompletionRequest) -> Self {
        Self {
            input_id: input_id.into(),
            request,
        }
    }
}

/// Totals of one batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Jobs submitted.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes produced by a fallback link.
    pub via_fallback: usize,
    /// Attempts across all completed jobs.
    pub attempts: u64,
    /// Input ids never scheduled because of a stop request.
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Jobs that produced a result.
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Runs jobs through a fallback chain with a bounded worker pool.
pub struct Dispatcher {
    orchestrator: Arc<FallbackOrchestrator>,
    workers: usize,
    stop: StopSignal,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<FallbackOrchestrator>) -> Self {
        Self {
            orchestrator,
            workers: DEFAULT_WORKERS,
            stop: StopSignal::new(),
        }
    }

    /// Worker bound, clamped to `[1, 10]`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Handle for requesting a stop from elsewhere.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run every job through `chain`, delivering results as they complete.
    pub async fn run(
        &self,
        jobs: Vec<ExtractionJob>,
        chain: &FallbackChain,
        output: &dyn OutputSink,
        errors: &dyn ErrorSink,
    ) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary {
            total: jobs.len(),
            ..RunSummary::default()
        };
        info!(
            jobs = summary.total,
            workers = self.workers,
            chain_links = chain.len(),
            "Starting batch run"
        );

        let chain = Arc::new(chain.clone());
        let mut pending = jobs.into_iter();
        let mut in_flight = JobSet::new();

        loop {
            while in_flight.len() < self.workers && !self.stop.is_stopped() {
                let Some(job) = pending.next() else {
                    break;
                };
                let orchestrator = Arc::clone(&self.orchestrator);
                let chain = Arc::clone(&chain);
                let stop = self.stop.clone();
                debug!(input_id = %job.input_id, "Scheduling job");

                let ExtractionJob { input_id, request } = job;
                in_flight.spawn(input_id, async move {
                    AssertUnwindSafe(orchestrator.complete(&chain, &request, Some(&stop)))
                        .catch_unwind()
                        .await
                        .map_err(|panic| format!("Job panicked: {}", panic_message(panic.as_ref())))
                });
            }

            let Some((input_id, joined)) = in_flight.join_next().await else {
                break;
            };

            let (result, status, attempts) = match joined.and_then(|outcome| outcome) {
                Ok(outcome) => (outcome.result, Some(outcome.status), outcome.attempts),
                Err(message) => {
                    error!(input_id = %input_id, "{}", message);
                    let primary = chain.primary();
                    let result = CompletionResult::failure(
                        &primary.provider,
                        &primary.model,
                        LlmError::Unknown(message),
                        Duration::ZERO,
                    );
                    (result, None, 0)
                }
            };

            summary.attempts += u64::from(attempts);
            if result.is_success() {
                summary.succeeded += 1;
                if status == Some(ChainStatus::ViaFallback) {
                    summary.via_fallback += 1;
                }
            } else {
                summary.failed += 1;
            }

            if let Err(e) = output.write_result(&input_id, &result).await {
                warn!(input_id = %input_id, error = %e, "Output sink failed");
            }
            if let Some(record) = ErrorRecord::from_result(&input_id, &result) {
                if let Err(e) = errors.write_error(&record).await {
                    warn!(input_id = %input_id, error = %e, "Error sink failed");
                }
            }
        }

        summary.skipped = pending.map(|job| job.input_id).collect();
        summary.elapsed = started.elapsed();

        if !summary.skipped.is_empty() {
            warn!(
                skipped = summary.skipped.len(),
                "Stop requested, unscheduled jobs skipped"
            );
        }
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            via_fallback = summary.via_fallback,
            attempts = summary.attempts,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Batch run complete"
        );
        summary
    }
}

/// Bounded set of job tasks that remembers which input each task serves.
struct JobSet<T> {
    tasks: JoinSet<T>,
    inputs: HashMap<Id, String>,
}

impl<T: Send + 'static> JobSet<T> {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            inputs: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn spawn<F>(&mut self, input_id: String, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.inputs.insert(handle.id(), input_id);
    }

    /// Next finished task with its input id. A task that panicked or was
    /// cancelled yields `Err` with a description.
    async fn join_next(&mut self) -> Option<(String, std::result::Result<T, String>)> {
        let joined = self.tasks.join_next_with_id().await?;
        Some(match joined {
            Ok((id, value)) => (self.inputs.remove(&id).unwrap_or_default(), Ok(value)),
            Err(e) => {
                let input_id = self.inputs.remove(&e.id()).unwrap_or_default();
                let message = if e.is_panic() {
                    format!("Job panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    "Job task was cancelled".to_string()
                };
                (input_id, Err(message))
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
