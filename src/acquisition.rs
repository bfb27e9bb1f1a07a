//! Streaming acquisition worker and session lifecycle.
//!
//! An acquisition session owns the shared ring buffer, the subscribed channel
//! list, the derive mode and the cooperative stop flag. `start` spawns one
//! background worker task that pulls one message per accelerator pulse from
//! the streaming source and appends value-complete records to the buffer;
//! `stop` flips the flag and awaits the worker.
//!
//! # Cancellation contract
//!
//! The stop flag is re-checked only at safe points: after each blocking
//! receive completes or times out. Cancellation therefore has receive-call
//! latency, not instant effect. Each receive is bounded by the configured
//! timeout, so worst-case shutdown latency is bounded even when the source
//! stops emitting.
//!
//! # Failure handling
//!
//! A stream error is terminal for the session: the worker logs it and exits
//! the loop without retrying. The operator restarts by toggling the session.
//! Receive timeouts are not errors; they only give the stop flag a chance to
//! be observed.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::SharedRingBuffer;
use crate::error::{AppResult, PhotodiagError};
use crate::measurement::{PulseMessage, StreamRecord};

/// A channel-multiplexed, pulse-synchronous streaming connection.
///
/// # Contract
/// - `receive` blocks until the next per-pulse message is available and
///   yields messages in pulse-arrival order.
/// - `receive` must be cancel safe: the worker races it against a timeout
///   and drops the in-flight future when the timeout wins, so an
///   implementation must not lose a pulse it has already taken off the wire
///   when dropped at an await point. Buffer such a pulse and return it from
///   the next call.
/// - `close` releases the underlying connection; the worker calls it on
///   every exit path (normal stop, stream error, cancellation).
#[async_trait]
pub trait StreamSource: Send {
    /// Block until the next pulse message arrives. Must be cancel safe, see
    /// the trait-level contract.
    async fn receive(&mut self) -> Result<PulseMessage>;

    /// Close the underlying connection.
    async fn close(&mut self) -> Result<()>;
}

/// How raw channel values of one pulse become a [`StreamRecord`].
///
/// Every mode skips the pulse entirely (visible skip, not a zero-fill) when a
/// required value is missing or a ratio denominator is zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeriveMode {
    /// Keep all subscribed channel values as-is.
    Raw,
    /// Cross-normalization between two devices: the channel list holds
    /// `split` channels of the first device followed by `split` channels of
    /// the second, and each second-device value is divided by its
    /// first-device counterpart.
    PairRatio {
        /// Number of channels belonging to the first device.
        split: usize,
    },
    /// Diode check: every channel is divided by the reference (I0) channel at
    /// `reference`, which itself is kept raw as the first output value.
    DiodeRatio {
        /// Index of the reference channel in the subscription list.
        reference: usize,
    },
}

impl DeriveMode {
    /// Derive a record from one pulse message, or `None` if the pulse must
    /// be skipped.
    pub fn derive(&self, channels: &[String], msg: &PulseMessage) -> Option<StreamRecord> {
        let values: Option<Vec<f64>> = channels.iter().map(|ch| msg.scalar(ch)).collect();
        let values = values?;

        let derived = match self {
            DeriveMode::Raw => values,
            DeriveMode::PairRatio { split } => {
                let split = *split;
                if values.len() != 2 * split {
                    return None;
                }
                if values[..split].iter().any(|v| *v == 0.0) {
                    return None;
                }
                let mut out = values[..split].to_vec();
                for i in 0..split {
                    out.push(values[split + i] / values[i]);
                }
                out
            }
            DeriveMode::DiodeRatio { reference } => {
                let i0 = *values.get(*reference)?;
                if i0 == 0.0 {
                    return None;
                }
                let mut out = vec![i0];
                for (i, v) in values.iter().enumerate() {
                    if i != *reference {
                        out.push(v / i0);
                    }
                }
                out
            }
        };

        Some(StreamRecord::new(msg.pulse_id, derived))
    }
}

/// Tuning knobs for an acquisition session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Ring buffer capacity (number of records).
    pub capacity: usize,
    /// Upper bound on a single blocking receive; bounds shutdown latency.
    pub receive_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            receive_timeout: Duration::from_millis(500),
        }
    }
}

/// An acquisition session: buffer, channel set, derive mode and stop flag.
///
/// Explicitly constructed and passed to whoever needs it; there are no
/// module-level singletons. At most one worker runs per session; `start`
/// while a worker is active is rejected.
pub struct AcquisitionSession {
    channels: Vec<String>,
    mode: DeriveMode,
    buffer: SharedRingBuffer<StreamRecord>,
    stop_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    options: SessionOptions,
}

impl AcquisitionSession {
    /// Create an idle session. The channel list must be non-empty.
    pub fn new(
        channels: Vec<String>,
        mode: DeriveMode,
        options: SessionOptions,
    ) -> AppResult<Self> {
        if channels.is_empty() {
            return Err(PhotodiagError::EmptyChannelList);
        }
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            buffer: SharedRingBuffer::new(options.capacity),
            channels,
            mode,
            stop_tx,
            worker: None,
            options,
        })
    }

    /// Handle to the session's ring buffer (for the refresh consumer).
    pub fn buffer(&self) -> SharedRingBuffer<StreamRecord> {
        self.buffer.clone()
    }

    /// Whether a worker task is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start the acquisition worker on `source`.
    ///
    /// The buffer is emptied first: each toggle starts a fresh acquisition.
    pub fn start<S>(&mut self, source: S) -> AppResult<()>
    where
        S: StreamSource + 'static,
    {
        if self.is_running() {
            return Err(PhotodiagError::AcquisitionActive);
        }
        self.buffer.clear();
        self.stop_tx.send_replace(false);

        let ctx = WorkerContext {
            channels: self.channels.clone(),
            mode: self.mode.clone(),
            buffer: self.buffer.clone(),
            stop_rx: self.stop_tx.subscribe(),
            receive_timeout: self.options.receive_timeout,
        };
        info!(channels = ?self.channels, capacity = self.buffer.capacity(), "starting acquisition");
        self.worker = Some(tokio::spawn(acquisition_loop(source, ctx)));
        Ok(())
    }

    /// Signal the worker to stop and wait for it to exit.
    ///
    /// Takes effect after the worker's current receive completes or times
    /// out. Safe to call when no worker is running.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "acquisition worker did not shut down cleanly");
            }
        }
    }
}

struct WorkerContext {
    channels: Vec<String>,
    mode: DeriveMode,
    buffer: SharedRingBuffer<StreamRecord>,
    stop_rx: watch::Receiver<bool>,
    receive_timeout: Duration,
}

async fn acquisition_loop<S: StreamSource>(mut source: S, ctx: WorkerContext) {
    let mut accepted: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        // Stop flag is only consulted here, between receives.
        if *ctx.stop_rx.borrow() {
            break;
        }

        let msg = match tokio::time::timeout(ctx.receive_timeout, source.receive()).await {
            Err(_) => continue, // timeout: give the stop flag a chance
            Ok(Err(e)) => {
                // Fail-stop: a dropped connection ends the session; the
                // operator restarts it by toggling.
                error!(error = %e, "stream receive failed, stopping acquisition");
                break;
            }
            Ok(Ok(msg)) => msg,
        };

        match ctx.mode.derive(&ctx.channels, &msg) {
            Some(record) => {
                ctx.buffer.push(record);
                accepted += 1;
            }
            None => skipped += 1,
        }
    }

    if let Err(e) = source.close().await {
        warn!(error = %e, "failed to close stream source");
    }
    debug!(accepted, skipped, "acquisition worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Parity;

    fn msg(pulse_id: u64, values: &[(&str, Option<f64>)]) -> PulseMessage {
        PulseMessage::from_scalars(
            pulse_id,
            values.iter().map(|(k, v)| (k.to_string(), *v)),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn raw_mode_requires_every_channel() {
        let channels = names(&["A", "B"]);
        let complete = msg(0, &[("A", Some(1.0)), ("B", Some(2.0))]);
        let incomplete = msg(1, &[("A", Some(1.0)), ("B", None)]);

        let record = DeriveMode::Raw.derive(&channels, &complete).expect("record");
        assert_eq!(record.values, vec![1.0, 2.0]);
        assert_eq!(record.parity, Parity::Even);
        assert!(DeriveMode::Raw.derive(&channels, &incomplete).is_none());
    }

    #[test]
    fn pair_ratio_normalizes_second_device_by_first() {
        let channels = names(&["X1", "Y1", "I1", "X2", "Y2", "I2"]);
        let mode = DeriveMode::PairRatio { split: 3 };
        let message = msg(
            3,
            &[
                ("X1", Some(2.0)),
                ("Y1", Some(4.0)),
                ("I1", Some(8.0)),
                ("X2", Some(1.0)),
                ("Y2", Some(1.0)),
                ("I2", Some(2.0)),
            ],
        );
        let record = mode.derive(&channels, &message).expect("record");
        assert_eq!(record.values, vec![2.0, 4.0, 8.0, 0.5, 0.25, 0.25]);
        assert_eq!(record.parity, Parity::Odd);
    }

    #[test]
    fn pair_ratio_skips_zero_denominator_pulses() {
        let channels = names(&["X1", "X2"]);
        let mode = DeriveMode::PairRatio { split: 1 };
        let zero_denom = msg(0, &[("X1", Some(0.0)), ("X2", Some(1.0))]);
        let missing = msg(1, &[("X1", Some(1.0)), ("X2", None)]);

        assert!(mode.derive(&channels, &zero_denom).is_none());
        assert!(mode.derive(&channels, &missing).is_none());
    }

    #[test]
    fn diode_ratio_keeps_reference_and_ratios() {
        let channels = names(&["up", "down", "left", "right"]);
        let mode = DeriveMode::DiodeRatio { reference: 2 };
        let message = msg(
            0,
            &[
                ("up", Some(2.0)),
                ("down", Some(4.0)),
                ("left", Some(2.0)),
                ("right", Some(6.0)),
            ],
        );
        let record = mode.derive(&channels, &message).expect("record");
        assert_eq!(record.values, vec![2.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn diode_ratio_skips_missing_or_zero_reference() {
        let channels = names(&["up", "down"]);
        let mode = DeriveMode::DiodeRatio { reference: 0 };
        assert!(mode
            .derive(&channels, &msg(0, &[("up", Some(0.0)), ("down", Some(1.0))]))
            .is_none());
        assert!(mode
            .derive(&channels, &msg(1, &[("up", None), ("down", Some(1.0))]))
            .is_none());
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        let err = AcquisitionSession::new(vec![], DeriveMode::Raw, SessionOptions::default())
            .err()
            .expect("error");
        assert!(matches!(err, PhotodiagError::EmptyChannelList));
    }
}
