//! Common measurement data types shared between the acquisition worker, the
//! refresh/aggregation step and the scan orchestration.
//!
//! One [`PulseMessage`] arrives per accelerator pulse from the streaming
//! source; the acquisition worker turns value-complete messages into
//! [`StreamRecord`]s, which are what the ring buffer holds.

use std::collections::HashMap;

/// Even/odd partition of pulses by pulse identifier.
///
/// Alternating experimental conditions ride on pulse parity, so every
/// aggregation splits records into the two buckets before computing
/// statistics. The split is exhaustive and disjoint: every pulse identifier
/// lands in exactly one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Parity {
    /// `pulse_id % 2 == 0`
    Even,
    /// `pulse_id % 2 == 1`
    Odd,
}

impl Parity {
    /// Derive the parity bucket from a pulse identifier.
    pub fn from_pulse_id(pulse_id: u64) -> Self {
        if pulse_id % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }
}

/// A channel value carried by a pulse message or a control-system channel.
///
/// Beam-synchronous channels deliver scalars (positions, intensities) or
/// waveforms (spectra); control-system record fields additionally accept text
/// (e.g. link-field assignments written during calibration push-back).
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelValue {
    /// A single numeric sample.
    Scalar(f64),
    /// An array sample, e.g. a spectrometer trace.
    Waveform(Vec<f64>),
    /// A text value (control-system record fields only).
    Text(String),
}

impl ChannelValue {
    /// The scalar payload, if this value is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ChannelValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// The waveform payload, if this value is a waveform.
    pub fn as_waveform(&self) -> Option<&[f64]> {
        match self {
            ChannelValue::Waveform(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Scalar(v)
    }
}

impl From<Vec<f64>> for ChannelValue {
    fn from(v: Vec<f64>) -> Self {
        ChannelValue::Waveform(v)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        ChannelValue::Text(v.to_string())
    }
}

/// One raw message from the streaming source, produced per accelerator pulse.
///
/// A subscribed channel may be missing from a given pulse (`None`); such
/// pulses are skipped by the acquisition worker rather than zero-filled.
#[derive(Clone, Debug)]
pub struct PulseMessage {
    /// Pulse sequence number assigned by the accelerator timing system.
    pub pulse_id: u64,
    /// Channel name to value; `None` marks a value missing from this pulse.
    pub values: HashMap<String, Option<ChannelValue>>,
}

impl PulseMessage {
    /// Build a message from scalar channel values.
    pub fn from_scalars<I>(pulse_id: u64, values: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<f64>)>,
    {
        Self {
            pulse_id,
            values: values
                .into_iter()
                .map(|(k, v)| (k, v.map(ChannelValue::Scalar)))
                .collect(),
        }
    }

    /// The scalar value of `channel`, or `None` if absent or non-scalar.
    pub fn scalar(&self, channel: &str) -> Option<f64> {
        self.values
            .get(channel)
            .and_then(|v| v.as_ref())
            .and_then(ChannelValue::as_scalar)
    }

    /// The waveform value of `channel`, or `None` if absent or non-waveform.
    pub fn waveform(&self, channel: &str) -> Option<&[f64]> {
        self.values
            .get(channel)
            .and_then(|v| v.as_ref())
            .and_then(ChannelValue::as_waveform)
    }
}

/// One row of acquired data, appended to the ring buffer per accepted pulse.
///
/// The arity of `values` is fixed for the lifetime of an acquisition session.
/// Records are only ever constructed from pulses where every required channel
/// value was present (and every ratio denominator non-zero), so a record never
/// carries sentinels.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
    /// Pulse identifier this record was derived from.
    pub pulse_id: u64,
    /// Parity bucket of the pulse.
    pub parity: Parity,
    /// One value per subscribed channel (or derived ratio), in channel order.
    pub values: Vec<f64>,
}

impl StreamRecord {
    /// Construct a record, deriving the parity bucket from the pulse id.
    pub fn new(pulse_id: u64, values: Vec<f64>) -> Self {
        Self {
            pulse_id,
            parity: Parity::from_pulse_id(pulse_id),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_is_exhaustive_and_disjoint() {
        for pulse_id in 0..100u64 {
            let parity = Parity::from_pulse_id(pulse_id);
            let expected = if pulse_id % 2 == 0 {
                Parity::Even
            } else {
                Parity::Odd
            };
            assert_eq!(parity, expected);
        }
    }

    #[test]
    fn scalar_lookup_distinguishes_missing_from_absent() {
        let msg = PulseMessage::from_scalars(
            7,
            vec![
                ("A".to_string(), Some(1.5)),
                ("B".to_string(), None),
            ],
        );
        assert_eq!(msg.scalar("A"), Some(1.5));
        assert_eq!(msg.scalar("B"), None);
        assert_eq!(msg.scalar("C"), None);
        assert_eq!(msg.pulse_id, 7);
    }

    #[test]
    fn waveform_lookup_rejects_scalars() {
        let mut values = HashMap::new();
        values.insert(
            "SPECTRUM_Y".to_string(),
            Some(ChannelValue::Waveform(vec![0.0, 1.0, 0.0])),
        );
        values.insert("INTENSITY".to_string(), Some(ChannelValue::Scalar(2.0)));
        let msg = PulseMessage { pulse_id: 1, values };

        assert_eq!(msg.waveform("SPECTRUM_Y"), Some(&[0.0, 1.0, 0.0][..]));
        assert_eq!(msg.waveform("INTENSITY"), None);
        assert_eq!(msg.scalar("INTENSITY"), Some(2.0));
    }

    #[test]
    fn record_derives_parity() {
        let rec = StreamRecord::new(11, vec![1.0, 2.0]);
        assert_eq!(rec.parity, Parity::Odd);
        assert_eq!(StreamRecord::new(10, vec![]).parity, Parity::Even);
    }
}
