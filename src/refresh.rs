//! Periodic refresh: snapshot the ring buffer, aggregate, publish.
//!
//! A [`RefreshTask`] ticks on a fixed wall-clock cadence. Each tick takes a
//! consistent snapshot of the session buffer, runs the panel's summarizer on
//! the copy and publishes the result over a `watch` channel for whoever
//! renders it. Two rules hold at this boundary:
//!
//! - Below the minimum sample count the published summary is the explicit
//!   empty state; statistics are never computed on too-small samples.
//! - A summarizer error (e.g. a non-converged fit) is logged and degrades to
//!   the empty state. A failing refresh never cancels the schedule and never
//!   panics the scheduler.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::buffer::SharedRingBuffer;
use crate::error::AppResult;
use crate::measurement::StreamRecord;
use crate::stats::{per_channel_mean_std, split_by_parity};

/// Aggregation step applied to a buffer snapshot on each tick.
pub trait Summarize: Send + 'static {
    /// Element type of the buffer being consumed.
    type Input: Clone + Send + 'static;
    /// Published summary type; `Default` is the empty display state.
    type Summary: Clone + Default + Send + Sync + 'static;

    /// Compute a summary from a snapshot. Called with at least
    /// [`min_samples`](Summarize::min_samples) records.
    fn summarize(&mut self, snapshot: &[Self::Input]) -> AppResult<Self::Summary>;

    /// Minimum snapshot size below which the empty state is published.
    fn min_samples(&self) -> usize {
        3
    }
}

/// Handle to a running refresh task.
pub struct RefreshTask<T> {
    summary_rx: watch::Receiver<T>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl<T: Clone + Default + Send + Sync + 'static> RefreshTask<T> {
    /// Spawn a refresh task over `buffer` at the given cadence.
    pub fn spawn<S>(
        buffer: SharedRingBuffer<S::Input>,
        mut summarizer: S,
        period: Duration,
    ) -> Self
    where
        S: Summarize<Summary = T>,
    {
        let (summary_tx, summary_rx) = watch::channel(T::default());
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let snapshot = buffer.snapshot();
                let summary = if snapshot.len() < summarizer.min_samples() {
                    T::default()
                } else {
                    match summarizer.summarize(&snapshot) {
                        Ok(summary) => summary,
                        Err(e) => {
                            // Degrade to the empty state; keep the schedule.
                            warn!(error = %e, "refresh aggregation failed");
                            T::default()
                        }
                    }
                };
                if summary_tx.send(summary).is_err() {
                    break; // all receivers gone
                }
            }
        });

        Self {
            summary_rx,
            stop_tx,
            task: Some(task),
        }
    }

    /// A receiver for published summaries.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.summary_rx.clone()
    }

    /// The most recently published summary.
    pub fn latest(&self) -> T {
        self.summary_rx.borrow().clone()
    }

    /// Stop the periodic schedule and wait for the task to exit.
    pub async fn stop(mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "refresh task did not shut down cleanly");
            }
        }
    }
}

/// Per-parity statistics of one bucket of records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParityBucket {
    /// Number of records in the bucket.
    pub count: usize,
    /// Value columns, channel-major (one inner vec per channel).
    pub columns: Vec<Vec<f64>>,
    /// Per-channel mean.
    pub mean: Vec<f64>,
    /// Per-channel population standard deviation.
    pub std: Vec<f64>,
}

/// Summary published by the correlation and jitter panels: the snapshot split
/// into parity buckets with per-channel statistics. Empty buckets (the
/// `Default`) render as blank plots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParitySummary {
    /// Records with even pulse identifiers.
    pub even: ParityBucket,
    /// Records with odd pulse identifiers.
    pub odd: ParityBucket,
}

impl ParitySummary {
    /// Whether this is the empty display state.
    pub fn is_empty(&self) -> bool {
        self.even.count == 0 && self.odd.count == 0
    }
}

/// Summarizer producing [`ParitySummary`] from stream records.
///
/// Shared by the correlation panel (2-D scatter of paired device channels)
/// and the jitter panel (position/intensity scatter); both display the same
/// parity-split columns, only the channel selection differs.
pub struct ParitySummarizer {
    min_samples: usize,
}

impl ParitySummarizer {
    /// Create a summarizer with the panel's minimum sample count.
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }
}

fn bucket(records: Vec<StreamRecord>) -> AppResult<ParityBucket> {
    let arity = records.first().map_or(0, |r| r.values.len());
    let mut columns = vec![Vec::with_capacity(records.len()); arity];
    for record in &records {
        for (column, value) in columns.iter_mut().zip(&record.values) {
            column.push(*value);
        }
    }
    let (mean, std) = per_channel_mean_std(&records)?;
    Ok(ParityBucket {
        count: records.len(),
        columns,
        mean,
        std,
    })
}

impl Summarize for ParitySummarizer {
    type Input = StreamRecord;
    type Summary = ParitySummary;

    fn summarize(&mut self, snapshot: &[StreamRecord]) -> AppResult<ParitySummary> {
        let (even, odd) = split_by_parity(snapshot);
        Ok(ParitySummary {
            even: bucket(even)?,
            odd: bucket(odd)?,
        })
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }
}
