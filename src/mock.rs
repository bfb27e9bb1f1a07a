//! Mock collaborators for tests and the demo binary.
//!
//! Every external seam has a mock here: the streaming source, the scan
//! actuator, channel access, the pipeline store and the logbook. The mocks
//! record what was written to them so integration tests can assert on the
//! persisted side effects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::acquisition::StreamSource;
use crate::control::{
    Attachment, ChannelAccess, ChannelUpdate, Logbook, PipelineConfig, PipelineStore,
};
use crate::measurement::{ChannelValue, PulseMessage};
use crate::scan::{Actuator, MoveFailure};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// MockStreamSource
// =============================================================================

enum SourceMode {
    /// Replay a fixed script, then fail like a dropped connection.
    Script(VecDeque<PulseMessage>),
    /// Generate noisy scalar pulses forever at a fixed rate.
    Generate {
        channels: Vec<(String, f64)>,
        period: Duration,
        dropout: f64,
    },
}

/// Mock beam-synchronous stream.
///
/// Scripted mode replays prepared messages and then errors, which exercises
/// the worker's fail-stop path. Generator mode produces one message per
/// `period` with ±5% noise around each channel's base value, optionally
/// dropping individual values to exercise skip handling.
pub struct MockStreamSource {
    mode: SourceMode,
    next_pulse: u64,
    closed: Arc<Mutex<bool>>,
}

impl MockStreamSource {
    /// Replay `messages` in order, then fail every subsequent receive.
    pub fn from_script(messages: Vec<PulseMessage>) -> Self {
        Self {
            mode: SourceMode::Script(messages.into()),
            next_pulse: 0,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Generate noisy scalar pulses for `channels` (name, base value).
    pub fn generator(channels: Vec<(String, f64)>, period: Duration) -> Self {
        Self {
            mode: SourceMode::Generate {
                channels,
                period,
                dropout: 0.0,
            },
            next_pulse: 0,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Drop individual channel values with the given probability.
    pub fn with_dropout(mut self, probability: f64) -> Self {
        if let SourceMode::Generate { dropout, .. } = &mut self.mode {
            *dropout = probability;
        }
        self
    }

    /// Shared flag set once `close` has been called.
    pub fn closed_flag(&self) -> Arc<Mutex<bool>> {
        self.closed.clone()
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn receive(&mut self) -> Result<PulseMessage> {
        match &mut self.mode {
            SourceMode::Script(queue) => queue
                .pop_front()
                .ok_or_else(|| anyhow!("stream connection lost")),
            SourceMode::Generate {
                channels,
                period,
                dropout,
            } => {
                let pulse_id = self.next_pulse;
                self.next_pulse += 1;
                let values: HashMap<String, Option<ChannelValue>> = {
                    let mut rng = rand::thread_rng();
                    channels
                        .iter()
                        .map(|(name, base)| {
                            let value = if rng.gen::<f64>() < *dropout {
                                None
                            } else {
                                let noisy = base * rng.gen_range(0.95..1.05);
                                Some(ChannelValue::Scalar(noisy))
                            };
                            (name.clone(), value)
                        })
                        .collect()
                };
                tokio::time::sleep(*period).await;
                Ok(PulseMessage { pulse_id, values })
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        *lock(&self.closed) = true;
        Ok(())
    }
}

// =============================================================================
// MockActuator
// =============================================================================

/// Mock stepper axis with soft limits.
pub struct MockActuator {
    position: f64,
    low: f64,
    high: f64,
    /// Positions of completed moves, for test assertions.
    visited: Vec<f64>,
}

impl MockActuator {
    /// Create an axis at position 0 with the given soft limits.
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            position: 0.0,
            low,
            high,
            visited: Vec::new(),
        }
    }

    /// Positions of completed moves in order.
    pub fn visited(&self) -> &[f64] {
        &self.visited
    }
}

#[async_trait]
impl Actuator for MockActuator {
    async fn move_to(&mut self, target: f64) -> Result<(), MoveFailure> {
        if target < self.low || target > self.high {
            return Err(MoveFailure::OutOfSoftLimits {
                target,
                low: self.low,
                high: self.high,
            });
        }
        self.position = target;
        self.visited.push(target);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.position)
    }
}

// =============================================================================
// MockChannelAccess
// =============================================================================

/// Mock control-system channel store.
///
/// `put` records the value and fans it out to subscribers of that channel;
/// a full subscriber queue drops the update, matching the ephemeral-delivery
/// contract of the real system.
#[derive(Clone, Default)]
pub struct MockChannelAccess {
    store: Arc<Mutex<HashMap<String, ChannelValue>>>,
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<ChannelUpdate>>>>>,
}

impl MockChannelAccess {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a channel value.
    pub fn preset(&self, channel: &str, value: ChannelValue) {
        lock(&self.store).insert(channel.to_string(), value);
    }

    /// The last value written to `channel`, if any.
    pub fn stored(&self, channel: &str) -> Option<ChannelValue> {
        lock(&self.store).get(channel).cloned()
    }

    /// Number of channels that have been written.
    pub fn len(&self) -> usize {
        lock(&self.store).len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        lock(&self.store).is_empty()
    }
}

#[async_trait]
impl ChannelAccess for MockChannelAccess {
    async fn get(&self, channel: &str) -> Result<ChannelValue> {
        lock(&self.store)
            .get(channel)
            .cloned()
            .ok_or_else(|| anyhow!("channel {channel} not connected"))
    }

    async fn put(&self, channel: &str, value: ChannelValue) -> Result<()> {
        lock(&self.store).insert(channel.to_string(), value.clone());
        let senders = lock(&self.subscribers)
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for tx in senders {
            let update = ChannelUpdate {
                channel: channel.to_string(),
                value: value.clone(),
            };
            let _ = tx.try_send(update); // full queue drops the update
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<ChannelUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        lock(&self.subscribers)
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// =============================================================================
// MockPipelineStore
// =============================================================================

/// Mock pipeline configuration store.
#[derive(Clone, Default)]
pub struct MockPipelineStore {
    configs: Arc<Mutex<HashMap<String, PipelineConfig>>>,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl MockPipelineStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The saved configuration of a pipeline, if any was stored.
    pub fn saved_config(&self, pipeline: &str) -> Option<PipelineConfig> {
        lock(&self.configs).get(pipeline).cloned()
    }

    /// Pipeline instances that were stopped, in order.
    pub fn stopped_instances(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }
}

#[async_trait]
impl PipelineStore for MockPipelineStore {
    async fn get_config(&self, pipeline: &str) -> Result<PipelineConfig> {
        Ok(lock(&self.configs)
            .get(pipeline)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_config(&self, pipeline: &str, config: PipelineConfig) -> Result<()> {
        lock(&self.configs).insert(pipeline.to_string(), config);
        Ok(())
    }

    async fn stop_instance(&self, pipeline: &str) -> Result<()> {
        lock(&self.stopped).push(pipeline.to_string());
        Ok(())
    }
}

// =============================================================================
// MockLogbook
// =============================================================================

/// One entry recorded by [`MockLogbook`].
#[derive(Clone, Debug)]
pub struct PostedEntry {
    /// Entry text.
    pub message: String,
    /// Attachment names (payloads are not kept).
    pub attachment_names: Vec<String>,
    /// Entry attributes.
    pub attributes: HashMap<String, String>,
}

/// Mock electronic logbook assigning sequential entry ids.
#[derive(Clone, Default)]
pub struct MockLogbook {
    entries: Arc<Mutex<Vec<PostedEntry>>>,
}

impl MockLogbook {
    /// Create an empty logbook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries posted so far, in order.
    pub fn entries(&self) -> Vec<PostedEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl Logbook for MockLogbook {
    async fn post(
        &self,
        message: &str,
        attachments: &[Attachment],
        attributes: &HashMap<String, String>,
    ) -> Result<u64> {
        let mut entries = lock(&self.entries);
        entries.push(PostedEntry {
            message: message.to_string(),
            attachment_names: attachments.iter().map(|a| a.name.clone()).collect(),
            attributes: attributes.clone(),
        });
        Ok(entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_source_replays_then_fails() {
        let messages = vec![
            PulseMessage::from_scalars(0, vec![("A".to_string(), Some(1.0))]),
            PulseMessage::from_scalars(1, vec![("A".to_string(), Some(2.0))]),
        ];
        let mut source = MockStreamSource::from_script(messages);
        assert_eq!(source.receive().await.expect("first").pulse_id, 0);
        assert_eq!(source.receive().await.expect("second").pulse_id, 1);
        assert!(source.receive().await.is_err());

        let closed = source.closed_flag();
        source.close().await.expect("close");
        assert!(*closed.lock().expect("flag"));
    }

    #[tokio::test]
    async fn generator_produces_sequential_pulse_ids() {
        let mut source = MockStreamSource::generator(
            vec![("INT".to_string(), 10.0)],
            Duration::from_millis(1),
        );
        let first = source.receive().await.expect("pulse");
        let second = source.receive().await.expect("pulse");
        assert_eq!(first.pulse_id, 0);
        assert_eq!(second.pulse_id, 1);
        let value = first.scalar("INT").expect("value");
        assert!((9.5..10.5).contains(&value));
    }

    #[tokio::test]
    async fn actuator_enforces_soft_limits() {
        let mut axis = MockActuator::new(-0.5, 0.5);
        axis.move_to(0.3).await.expect("in range");
        let err = axis.move_to(0.7).await.err().expect("out of range");
        assert!(matches!(err, MoveFailure::OutOfSoftLimits { .. }));
        assert_eq!(axis.visited(), &[0.3]);
        assert_eq!(axis.position().await.expect("position"), 0.3);
    }

    #[tokio::test]
    async fn channel_put_notifies_subscribers() {
        let access = MockChannelAccess::new();
        let mut rx = access.subscribe("DEV:XPOS").await.expect("subscribe");
        access
            .put("DEV:XPOS", ChannelValue::Scalar(1.5))
            .await
            .expect("put");

        let update = rx.recv().await.expect("update");
        assert_eq!(update.channel, "DEV:XPOS");
        assert_eq!(update.value, ChannelValue::Scalar(1.5));
        assert_eq!(access.stored("DEV:XPOS"), Some(ChannelValue::Scalar(1.5)));
    }

    #[tokio::test]
    async fn pipeline_store_records_saves_and_stops() {
        let store = MockPipelineStore::new();
        let mut config = store.get_config("proc").await.expect("config");
        assert!(config.is_empty());
        config.insert("queue_length".into(), 5000i64.into());
        store.save_config("proc", config).await.expect("save");
        store.stop_instance("proc").await.expect("stop");

        assert!(store.saved_config("proc").is_some());
        assert_eq!(store.stopped_instances(), vec!["proc".to_string()]);
    }
}
