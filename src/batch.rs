//! Bounded-concurrency batch execution.
//!
//! Splits work into sequential chunks; within a chunk up to
//! `concurrency` workers run at once, so peak outstanding requests are
//! capped regardless of total item count. Per-item failures are
//! captured into the item's result slot and never abort the chunk or
//! the run.
//!
//! ```text
//! items ── chunk 1 ──► [w w w w]  ─► progress
//!       ── chunk 2 ──► [w w w w]  ─► progress
//!       ── ...
//! ```
//!
//! Output order always matches input order, even though execution
//! within a chunk is concurrent. [`BatchExecutor::run_chunk`] exposes a
//! single chunk for callers that interleave their own work (checkpoint
//! persistence) between chunks; [`BatchExecutor::run_stream`] is the
//! lazy one-at-a-time variant.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

/// Execution shape for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOptions {
    /// Concurrent workers within a chunk.
    pub concurrency: usize,
    /// Items per chunk.
    pub chunk_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_size: 10,
        }
    }
}

/// Progress snapshot fired at chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub percentage: f32,
}

impl BatchProgress {
    pub fn new(processed: usize, total: usize, successful: usize, failed: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f32 / total as f32 * 100.0
        };
        Self {
            processed,
            total,
            successful,
            failed,
            percentage,
        }
    }
}

/// Progress callback shared across chunks.
pub type ProgressHook = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Optional per-batch callbacks.
pub struct BatchHooks<I, E> {
    /// Fired after every chunk with monotonically non-decreasing
    /// `processed`.
    pub on_progress: Option<ProgressHook>,
    /// Fired once per failed item with the item, its input index, and
    /// the captured error.
    #[allow(clippy::type_complexity)]
    pub on_error: Option<Arc<dyn Fn(&I, usize, &E) + Send + Sync>>,
}

impl<I, E> Default for BatchHooks<I, E> {
    fn default() -> Self {
        Self {
            on_progress: None,
            on_error: None,
        }
    }
}

impl<I, E> Clone for BatchHooks<I, E> {
    fn clone(&self) -> Self {
        Self {
            on_progress: self.on_progress.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// Chunked bounded-concurrency runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchExecutor {
    options: BatchOptions,
}

impl BatchExecutor {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    /// Run one chunk. `base_index` is the chunk's offset in the full
    /// input, so workers and hooks see input-relative indices.
    ///
    /// Exactly one result slot per chunk item, in chunk order.
    pub async fn run_chunk<I, T, E, W, Fut>(
        &self,
        chunk: &[I],
        base_index: usize,
        worker: &W,
        hooks: &BatchHooks<I, E>,
    ) -> Vec<Result<T, E>>
    where
        I: Clone,
        E: std::fmt::Display,
        W: Fn(I, usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let concurrency = self.options.concurrency.max(1);
        let indexed: Vec<(usize, Result<T, E>)> =
            stream::iter(chunk.iter().cloned().enumerate())
                .map(|(offset, item)| {
                    let fut = worker(item, base_index + offset);
                    async move { (offset, fut.await) }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut slots: Vec<Option<Result<T, E>>> = Vec::with_capacity(chunk.len());
        slots.resize_with(chunk.len(), || None);
        for (offset, result) in indexed {
            if let Err(ref error) = result {
                warn!(index = base_index + offset, error = %error, "worker failed; isolating item");
                if let Some(hook) = &hooks.on_error {
                    hook(&chunk[offset], base_index + offset, error);
                }
            }
            slots[offset] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.expect("every chunk slot written exactly once"))
            .collect()
    }

    /// Run all items through sequential chunks.
    ///
    /// The result vector has one entry per input item, in input order;
    /// a failing worker only fails its own slot.
    pub async fn run<I, T, E, W, Fut>(
        &self,
        items: Vec<I>,
        worker: W,
        hooks: BatchHooks<I, E>,
    ) -> Vec<Result<T, E>>
    where
        I: Clone,
        E: std::fmt::Display,
        W: Fn(I, usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = items.len();
        let chunk_size = self.options.chunk_size.max(1);
        let mut results = Vec::with_capacity(total);
        let mut successful = 0usize;
        let mut failed = 0usize;

        for (chunk_idx, chunk) in items.chunks(chunk_size).enumerate() {
            let chunk_results = self
                .run_chunk(chunk, chunk_idx * chunk_size, &worker, &hooks)
                .await;
            for result in &chunk_results {
                match result {
                    Ok(_) => successful += 1,
                    Err(_) => failed += 1,
                }
            }
            results.extend(chunk_results);
            debug!(
                processed = results.len(),
                total, successful, failed, "chunk complete"
            );
            if let Some(hook) = &hooks.on_progress {
                hook(BatchProgress::new(results.len(), total, successful, failed));
            }
        }
        results
    }

    /// Streaming variant: items in, per-item results out, arrival order
    /// preserved, up to `concurrency` in flight. Per-item error
    /// isolation is identical to [`run`](Self::run) — an `Err` occupies
    /// the item's output slot.
    pub fn run_stream<'a, I, T, E, W, Fut, S>(
        &self,
        items: S,
        worker: W,
    ) -> impl Stream<Item = Result<T, E>> + 'a
    where
        S: Stream<Item = I> + 'a,
        W: Fn(I, usize) -> Fut + 'a,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        let concurrency = self.options.concurrency.max(1);
        items
            .enumerate()
            .map(move |(index, item)| worker(item, index))
            .buffered(concurrency)
    }
}
