//! Control-system collaborator interfaces.
//!
//! The acquisition core does not own any wire format; the control system,
//! pipeline configuration store and electronic logbook are black boxes
//! consumed through the narrow traits in this module. Each trait is:
//!
//! - async (`#[async_trait]`)
//! - thread-safe (`Send + Sync`)
//! - fallible via `anyhow::Result`
//! - focused on one collaborator
//!
//! Channel change notifications are delivered over an explicit `mpsc` queue
//! rather than a callback: the producer side may run on any thread, and the
//! consumer drains the queue on its own task, so delivery thread and consumer
//! thread are fully decoupled.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::measurement::ChannelValue;

/// A change notification for a subscribed channel.
#[derive(Clone, Debug)]
pub struct ChannelUpdate {
    /// Channel name the update belongs to.
    pub channel: String,
    /// The new value.
    pub value: ChannelValue,
}

/// Get/put access to named control-system channels.
///
/// # Contract
/// - `put` has wait-for-completion semantics: when it returns, the value has
///   been accepted by the control system.
/// - `subscribe` returns a bounded queue of change notifications; if the
///   consumer falls behind, the producer may drop updates (monitoring data is
///   ephemeral by nature).
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    /// Read the current value of a channel.
    async fn get(&self, channel: &str) -> Result<ChannelValue>;

    /// Write a channel value, waiting for completion.
    async fn put(&self, channel: &str, value: ChannelValue) -> Result<()>;

    /// Subscribe to change notifications for a channel.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<ChannelUpdate>>;
}

/// A scalar or list entry in a pipeline configuration record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Integer entry. Listed before `Float` so untagged deserialization
    /// keeps whole numbers integral.
    Int(i64),
    /// Numeric entry.
    Float(f64),
    /// Text entry.
    Text(String),
    /// Numeric list entry.
    List(Vec<f64>),
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

/// A named configuration record: string keys to scalars/lists.
pub type PipelineConfig = HashMap<String, ConfigValue>;

/// Get/save access to named pipeline configuration records, used to persist
/// calibration coefficients.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Fetch the configuration record of a pipeline instance.
    async fn get_config(&self, pipeline: &str) -> Result<PipelineConfig>;

    /// Save a configuration record, replacing the stored one.
    async fn save_config(&self, pipeline: &str, config: PipelineConfig) -> Result<()>;

    /// Stop a running pipeline instance so it restarts with the new config.
    async fn stop_instance(&self, pipeline: &str) -> Result<()>;
}

/// A named image/file payload attached to a logbook entry.
#[derive(Clone, Debug)]
pub struct Attachment {
    /// File name under which the payload is attached.
    pub name: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

/// Electronic logbook client.
#[async_trait]
pub trait Logbook: Send + Sync {
    /// Post an entry; returns the identifier assigned by the logbook.
    async fn post(
        &self,
        message: &str,
        attachments: &[Attachment],
        attributes: &HashMap<String, String>,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_serialize_untagged() {
        let mut config = PipelineConfig::new();
        config.insert("horiz_calib".into(), ConfigValue::Float(1.2));
        config.insert("queue_length".into(), ConfigValue::Int(5000));

        let json = serde_json::to_string(&config).expect("serialize");
        let back: PipelineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.get("queue_length"), Some(&ConfigValue::Int(5000)));
        assert_eq!(back.get("horiz_calib"), Some(&ConfigValue::Float(1.2)));
    }

    #[test]
    fn config_value_conversions() {
        assert_eq!(ConfigValue::from(2.5), ConfigValue::Float(2.5));
        assert_eq!(ConfigValue::from("A*E+B*F"), ConfigValue::Text("A*E+B*F".into()));
    }
}
