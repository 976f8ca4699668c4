//! Bounded, order-preserving fan-out of extraction units.
//!
//! The coordinator dispatches units in `batch_size` chunks to a worker pool
//! bounded by `max_concurrency`, under one of two interchangeable
//! scheduling models with identical outcomes: spawned tasks behind a
//! semaphore (parallel workers on a multi-thread runtime) or a cooperative
//! concurrency-limited stream on the calling task. Pipeline logic is
//! written once against the unit closure; only dispatch differs.
//!
//! Output order always matches input order, regardless of completion order.
//! One unit's failure never affects another's execution.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use crate::error::LlmErrorKind;
use crate::unit::{ExtractionOutcome, ExtractionUnit};

/// How units are scheduled onto the concurrency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// One spawned task per unit, bounded by a semaphore. Units run in
    /// parallel across runtime worker threads.
    #[default]
    Spawned,
    /// A single cooperative scheduler issuing concurrency-limited calls on
    /// the current task.
    Cooperative,
}

/// Shared cancellation signal for an in-flight request.
///
/// Cancelling stops new units from being dispatched; units already running
/// finish normally and their outcomes are preserved. Undispatched units are
/// reported as failures of kind [`LlmErrorKind::Cancelled`], so the result
/// still accounts for every input unit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fans units out across a bounded pool and collects outcomes in input
/// order.
#[derive(Debug, Clone)]
pub struct ConcurrencyCoordinator {
    max_concurrency: usize,
    batch_size: usize,
    mode: ProcessingMode,
}

impl ConcurrencyCoordinator {
    /// Create a coordinator. Both bounds must be nonzero (validated by the
    /// extractor's configuration).
    pub fn new(max_concurrency: usize, batch_size: usize, mode: ProcessingMode) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            batch_size: batch_size.max(1),
            mode,
        }
    }

    /// Run every unit through `run_unit`, returning one outcome per unit in
    /// input order.
    ///
    /// Units are dispatched batch by batch; each batch completes before the
    /// next begins. The cancel flag is consulted before every dispatch.
    pub async fn run<F, Fut>(
        &self,
        units: Vec<ExtractionUnit>,
        cancel: &CancelFlag,
        run_unit: F,
    ) -> Vec<ExtractionOutcome>
    where
        F: Fn(ExtractionUnit) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ExtractionOutcome> + Send + 'static,
    {
        let total = units.len();
        let mut outcomes = Vec::with_capacity(total);
        let batches: Vec<Vec<ExtractionUnit>> = {
            let mut remaining = units;
            let mut out = Vec::new();
            while !remaining.is_empty() {
                let take = self.batch_size.min(remaining.len());
                out.push(remaining.drain(..take).collect());
            }
            out
        };

        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            tracing::debug!(
                batch = index + 1,
                batches = batch_count,
                units = batch.len(),
                "dispatching batch"
            );
            let batch_outcomes = match self.mode {
                ProcessingMode::Spawned => self.run_spawned(batch, cancel, &run_unit).await,
                ProcessingMode::Cooperative => self.run_cooperative(batch, cancel, &run_unit).await,
            };
            outcomes.extend(batch_outcomes);
        }

        debug_assert_eq!(outcomes.len(), total);
        outcomes
    }

    async fn run_spawned<F, Fut>(
        &self,
        batch: Vec<ExtractionUnit>,
        cancel: &CancelFlag,
        run_unit: &F,
    ) -> Vec<ExtractionOutcome>
    where
        F: Fn(ExtractionUnit) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ExtractionOutcome> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(batch.len());

        for unit in batch {
            if cancel.is_cancelled() {
                handles.push(Err(cancelled_outcome(&unit)));
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let unit_id = unit.id;
            let run_unit = run_unit.clone();
            let task = tokio::spawn(async move {
                let _permit = permit;
                run_unit(unit).await
            });
            handles.push(Ok((unit_id, task)));
        }

        // Awaiting handles in dispatch order restores input order.
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle {
                Ok((unit_id, task)) => match task.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => {
                        tracing::error!(unit_id, error = %err, "unit task aborted");
                        outcomes.push(ExtractionOutcome::Failure {
                            unit_id,
                            kind: LlmErrorKind::InvalidResponse,
                            message: format!("unit task aborted: {err}"),
                            attempts: 0,
                        });
                    }
                },
                Err(cancelled) => outcomes.push(cancelled),
            }
        }
        outcomes
    }

    async fn run_cooperative<F, Fut>(
        &self,
        batch: Vec<ExtractionUnit>,
        cancel: &CancelFlag,
        run_unit: &F,
    ) -> Vec<ExtractionOutcome>
    where
        F: Fn(ExtractionUnit) -> Fut + Send + Sync + Clone,
        Fut: Future<Output = ExtractionOutcome> + Send,
    {
        let mut indexed: Vec<(usize, ExtractionOutcome)> = stream::iter(
            batch.into_iter().enumerate().map(|(position, unit)| {
                let run_unit = run_unit.clone();
                let cancel = cancel.clone();
                async move {
                    // The stream starts futures lazily, so this check gates
                    // dispatch rather than completion.
                    if cancel.is_cancelled() {
                        (position, cancelled_outcome(&unit))
                    } else {
                        (position, run_unit(unit).await)
                    }
                }
            }),
        )
        .buffer_unordered(self.max_concurrency)
        .collect()
        .await;

        indexed.sort_by_key(|(position, _)| *position);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

fn cancelled_outcome(unit: &ExtractionUnit) -> ExtractionOutcome {
    ExtractionOutcome::Failure {
        unit_id: unit.id,
        kind: LlmErrorKind::Cancelled,
        message: "request cancelled before dispatch".into(),
        attempts: 0,
    }
}
