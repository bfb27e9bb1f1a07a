//! Spectrometer waveform acquisition and spectral summarizers.
//!
//! Three panels consume single-shot spectrometer waveforms rather than scalar
//! records: the autocorrelation width panel, the spectrum/I0 correlation panel
//! and the spectral peak-count panel. They share one acquisition path: a
//! [`SpectralSession`] buffers one [`SpectrumShot`] per accepted pulse, and a
//! summarizer runs over the snapshot on each refresh tick.
//!
//! The lag axis is derived once per session from the wavelength axis channel
//! (its value recentred on the middle sample); a change of the axis mid-
//! session resets the shot buffer, since shots taken against different axes
//! must not be pooled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acquisition::StreamSource;
use crate::buffer::SharedRingBuffer;
use crate::error::{AppResult, PhotodiagError};
use crate::fit::{fit_autocorrelation, FittedParam};
use crate::refresh::Summarize;
use crate::stats::{
    abs_gradient, bin_spectra_by_i0, box_smooth, find_peaks, histogram, i0_bin_edges,
    pearson_per_bin,
};

/// One accepted spectrometer pulse.
#[derive(Clone, Debug, PartialEq)]
pub struct SpectrumShot {
    /// Pulse identifier.
    pub pulse_id: u64,
    /// The single-shot waveform.
    pub waveform: Vec<f64>,
    /// The I0 intensity of the same pulse, when the session subscribes one.
    pub i0: Option<f64>,
}

/// Channels a spectral session subscribes to.
#[derive(Clone, Debug)]
pub struct SpectralChannels {
    /// Wavelength/photon-energy axis channel (waveform).
    pub axis: String,
    /// Single-shot spectrum channel (waveform).
    pub spectrum: String,
    /// Optional I0 intensity channel (scalar) for normalization panels.
    pub i0: Option<String>,
}

/// Shared lag axis, set from the first axis waveform of a session.
#[derive(Clone, Debug, Default)]
pub struct LagAxis {
    inner: Arc<Mutex<Vec<f64>>>,
}

impl LagAxis {
    fn set_from_axis(&self, axis: &[f64]) {
        let mid = axis.get(axis.len() / 2).copied().unwrap_or(0.0);
        let lags = axis.iter().map(|x| x - mid).collect();
        *self.lock() = lags;
    }

    /// Current lag values (empty until the first axis waveform arrives).
    pub fn get(&self) -> Vec<f64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<f64>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Acquisition session for waveform panels.
///
/// Same lifecycle contract as [`crate::acquisition::AcquisitionSession`]:
/// cooperative stop flag checked between bounded receives, fail-stop on
/// stream errors, connection closed on every exit path.
pub struct SpectralSession {
    channels: SpectralChannels,
    buffer: SharedRingBuffer<SpectrumShot>,
    lags: LagAxis,
    stop_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    receive_timeout: Duration,
}

impl SpectralSession {
    /// Create an idle session with the given shot-buffer capacity.
    pub fn new(channels: SpectralChannels, capacity: usize, receive_timeout: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            channels,
            buffer: SharedRingBuffer::new(capacity),
            lags: LagAxis::default(),
            stop_tx,
            worker: None,
            receive_timeout,
        }
    }

    /// Handle to the shot buffer.
    pub fn buffer(&self) -> SharedRingBuffer<SpectrumShot> {
        self.buffer.clone()
    }

    /// Handle to the shared lag axis.
    pub fn lags(&self) -> LagAxis {
        self.lags.clone()
    }

    /// Whether a worker task is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start the waveform worker on `source`.
    pub fn start<S>(&mut self, source: S) -> AppResult<()>
    where
        S: StreamSource + 'static,
    {
        if self.is_running() {
            return Err(PhotodiagError::AcquisitionActive);
        }
        self.buffer.clear();
        self.stop_tx.send_replace(false);

        let channels = self.channels.clone();
        let buffer = self.buffer.clone();
        let lags = self.lags.clone();
        let stop_rx = self.stop_tx.subscribe();
        let timeout = self.receive_timeout;
        info!(axis = %channels.axis, spectrum = %channels.spectrum, "starting spectral acquisition");
        self.worker = Some(tokio::spawn(spectral_loop(
            source, channels, buffer, lags, stop_rx, timeout,
        )));
        Ok(())
    }

    /// Signal the worker to stop and wait for it to exit.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "spectral worker did not shut down cleanly");
            }
        }
    }
}

async fn spectral_loop<S: StreamSource>(
    mut source: S,
    channels: SpectralChannels,
    buffer: SharedRingBuffer<SpectrumShot>,
    lags: LagAxis,
    stop_rx: watch::Receiver<bool>,
    receive_timeout: Duration,
) {
    let mut current_axis: Vec<f64> = Vec::new();
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let msg = match tokio::time::timeout(receive_timeout, source.receive()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!(error = %e, "stream receive failed, stopping spectral acquisition");
                break;
            }
            Ok(Ok(msg)) => msg,
        };

        let Some(axis) = msg.waveform(&channels.axis) else {
            continue;
        };
        let Some(waveform) = msg.waveform(&channels.spectrum) else {
            continue;
        };
        let i0 = match &channels.i0 {
            Some(ch) => match msg.scalar(ch) {
                Some(v) => Some(v),
                None => continue, // I0 required but missing: skip the pulse
            },
            None => None,
        };

        if axis != current_axis.as_slice() {
            // New axis invalidates pooled shots.
            current_axis = axis.to_vec();
            lags.set_from_axis(&current_axis);
            buffer.clear();
        }

        buffer.push(SpectrumShot {
            pulse_id: msg.pulse_id,
            waveform: waveform.to_vec(),
            i0,
        });
    }

    if let Err(e) = source.close().await {
        warn!(error = %e, "failed to close stream source");
    }
    debug!("spectral worker exited");
}

// ---------------------------------------------------------------------------
// Autocorrelation width panel
// ---------------------------------------------------------------------------

/// One fitted component in an [`AutocorrelationSummary`].
#[derive(Clone, Debug, Default)]
pub struct ComponentCurve {
    /// Component label (`bkg`, `env`, `spike`).
    pub name: String,
    /// The component evaluated over the lag axis.
    pub curve: Vec<f64>,
    /// Autocorrelation sigma of the component.
    pub sigma: Option<FittedParam>,
    /// Source-width sigma (`sigma / 1.4`).
    pub source_sigma: f64,
    /// Source-width FWHM.
    pub source_fwhm: f64,
}

/// Summary of the autocorrelation panel refresh.
#[derive(Clone, Debug, Default)]
pub struct AutocorrelationSummary {
    /// Lag axis the curves are sampled on.
    pub lags: Vec<f64>,
    /// Pooled, max-normalized mean waveform.
    pub mean_waveform: Vec<f64>,
    /// Summed best-fit curve.
    pub best_fit: Vec<f64>,
    /// Background, envelope and spike component curves.
    pub components: Vec<ComponentCurve>,
    /// When the summary was computed.
    pub computed_at: Option<chrono::DateTime<chrono::Local>>,
}

impl AutocorrelationSummary {
    /// Whether this is the empty display state.
    pub fn is_empty(&self) -> bool {
        self.mean_waveform.is_empty()
    }
}

/// Summarizer for the autocorrelation width panel.
///
/// Pools the buffered shots (both parities) into a mean waveform, normalizes
/// it to its maximum and fits the three-component Gaussian model.
pub struct AutocorrelationSummarizer {
    lags: LagAxis,
    min_samples: usize,
}

impl AutocorrelationSummarizer {
    /// Create a summarizer reading the session's lag axis.
    pub fn new(lags: LagAxis, min_samples: usize) -> Self {
        Self { lags, min_samples }
    }
}

impl Summarize for AutocorrelationSummarizer {
    type Input = SpectrumShot;
    type Summary = AutocorrelationSummary;

    fn summarize(&mut self, snapshot: &[SpectrumShot]) -> AppResult<AutocorrelationSummary> {
        let lags = self.lags.get();
        let mean = mean_waveform(snapshot, lags.len())?;
        let peak = mean.iter().copied().fold(f64::MIN, f64::max);
        if !(peak > 0.0) {
            return Err(PhotodiagError::Fit("waveform has no positive peak".into()));
        }
        let normalized: Vec<f64> = mean.iter().map(|v| v / peak).collect();

        let fit = fit_autocorrelation(&lags, &normalized)?;
        let components = fit
            .components
            .iter()
            .map(|c| ComponentCurve {
                name: c.name.to_string(),
                curve: c.eval(&lags),
                sigma: Some(c.sigma),
                source_sigma: c.source_sigma(),
                source_fwhm: c.source_fwhm(),
            })
            .collect();

        Ok(AutocorrelationSummary {
            lags,
            mean_waveform: normalized,
            best_fit: fit.best_fit,
            components,
            computed_at: Some(chrono::Local::now()),
        })
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }
}

fn mean_waveform(snapshot: &[SpectrumShot], expected_len: usize) -> AppResult<Vec<f64>> {
    let Some(first) = snapshot.first() else {
        return Err(PhotodiagError::InsufficientSamples { needed: 1, got: 0 });
    };
    let len = first.waveform.len();
    if expected_len != 0 && len != expected_len {
        return Err(PhotodiagError::ShapeMismatch {
            expected: expected_len,
            got: len,
        });
    }
    let mut mean = vec![0.0; len];
    for shot in snapshot {
        if shot.waveform.len() != len {
            return Err(PhotodiagError::ShapeMismatch {
                expected: len,
                got: shot.waveform.len(),
            });
        }
        for (acc, v) in mean.iter_mut().zip(&shot.waveform) {
            *acc += v;
        }
    }
    let n = snapshot.len() as f64;
    for v in &mut mean {
        *v /= n;
    }
    Ok(mean)
}

// ---------------------------------------------------------------------------
// Spectrum / I0 correlation panel
// ---------------------------------------------------------------------------

/// Summary of the spectrum/I0 correlation panel refresh.
#[derive(Clone, Debug, Default)]
pub struct SpectrumCorrelationSummary {
    /// Per-bin Pearson correlation of the spectrum stack against I0.
    pub correlation: Vec<f64>,
    /// Mean spectrum of the lowest-I0 bin.
    pub min_bin_spectrum: Vec<f64>,
    /// Mean spectrum of the middle-I0 bin.
    pub mid_bin_spectrum: Vec<f64>,
    /// Mean spectrum of the highest-I0 bin.
    pub max_bin_spectrum: Vec<f64>,
    /// The raw single-shot stack (shot-major) for image display.
    pub shots: Vec<Vec<f64>>,
}

impl SpectrumCorrelationSummary {
    /// Whether this is the empty display state.
    pub fn is_empty(&self) -> bool {
        self.correlation.is_empty()
    }
}

/// Summarizer for the spectrum/I0 correlation panel.
pub struct SpectrumCorrelationSummarizer {
    num_bins: usize,
    min_samples: usize,
}

impl SpectrumCorrelationSummarizer {
    /// Create a summarizer with the given number of I0 bins.
    pub fn new(num_bins: usize, min_samples: usize) -> Self {
        Self {
            num_bins,
            min_samples,
        }
    }
}

impl Summarize for SpectrumCorrelationSummarizer {
    type Input = SpectrumShot;
    type Summary = SpectrumCorrelationSummary;

    fn summarize(&mut self, snapshot: &[SpectrumShot]) -> AppResult<SpectrumCorrelationSummary> {
        let mut spectra = Vec::with_capacity(snapshot.len());
        let mut i0 = Vec::with_capacity(snapshot.len());
        for shot in snapshot {
            let Some(intensity) = shot.i0 else {
                return Err(PhotodiagError::Stream(
                    "spectrum/I0 panel requires an I0 channel".into(),
                ));
            };
            spectra.push(shot.waveform.clone());
            i0.push(intensity);
        }

        let correlation = pearson_per_bin(&spectra, &i0)?;
        let edges = i0_bin_edges(&i0, self.num_bins);
        let binned = bin_spectra_by_i0(&i0, &edges, &spectra)?;
        let min_bin_spectrum = binned.first().cloned().unwrap_or_default();
        let mid_bin_spectrum = binned.get(binned.len() / 2).cloned().unwrap_or_default();
        let max_bin_spectrum = binned.last().cloned().unwrap_or_default();

        Ok(SpectrumCorrelationSummary {
            correlation,
            min_bin_spectrum,
            mid_bin_spectrum,
            max_bin_spectrum,
            shots: spectra,
        })
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }
}

// ---------------------------------------------------------------------------
// Spectral peak-count panel
// ---------------------------------------------------------------------------

/// Settings for single-shot peak detection.
#[derive(Clone, Debug)]
pub struct PeakDetection {
    /// Box smoothing kernel size in samples.
    pub kernel_size: usize,
    /// Minimum peak separation in samples.
    pub min_distance: usize,
    /// Minimum gradient peak height.
    pub min_height: f64,
}

impl Default for PeakDetection {
    fn default() -> Self {
        Self {
            kernel_size: 100,
            min_distance: 100,
            min_height: 0.002,
        }
    }
}

/// Summary of the spectral peak-count panel refresh.
#[derive(Clone, Debug, Default)]
pub struct PeakCountSummary {
    /// Latest single-shot waveform, max-normalized.
    pub latest: Vec<f64>,
    /// The smoothed waveform.
    pub smoothed: Vec<f64>,
    /// Absolute gradient of the smoothed waveform.
    pub gradient: Vec<f64>,
    /// Detected peak indices on the gradient trace.
    pub peak_indices: Vec<usize>,
    /// Histogram left edges of the peak-count distribution.
    pub histogram_edges: Vec<f64>,
    /// Histogram counts of the peak-count distribution.
    pub histogram_counts: Vec<usize>,
}

impl PeakCountSummary {
    /// Whether this is the empty display state.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Summarizer for the spectral peak-count panel.
///
/// Each spectral peak produces two gradient extrema (rising and falling
/// edge), so the per-shot peak count is half the number of detected gradient
/// peaks. The distribution is binned at 0.5 so half-counts from unpaired
/// edges stay visible.
pub struct PeakCountSummarizer {
    detection: PeakDetection,
    min_samples: usize,
}

impl PeakCountSummarizer {
    /// Create a summarizer with the given detection settings.
    pub fn new(detection: PeakDetection, min_samples: usize) -> Self {
        Self {
            detection,
            min_samples,
        }
    }

    fn shot_analysis(&self, waveform: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<usize>) {
        let peak = waveform.iter().copied().fold(f64::MIN, f64::max);
        let normalized: Vec<f64> = if peak > 0.0 {
            waveform.iter().map(|v| v / peak).collect()
        } else {
            waveform.to_vec()
        };
        let smoothed = box_smooth(&normalized, self.detection.kernel_size);
        let gradient = abs_gradient(&smoothed);
        let peaks = find_peaks(
            &gradient,
            self.detection.min_distance,
            self.detection.min_height,
        );
        (normalized, smoothed, gradient, peaks)
    }
}

impl Summarize for PeakCountSummarizer {
    type Input = SpectrumShot;
    type Summary = PeakCountSummary;

    fn summarize(&mut self, snapshot: &[SpectrumShot]) -> AppResult<PeakCountSummary> {
        let counts: Vec<f64> = snapshot
            .iter()
            .map(|shot| self.shot_analysis(&shot.waveform).3.len() as f64 / 2.0)
            .collect();

        let lo = counts.iter().copied().fold(f64::MAX, f64::min);
        let hi = counts.iter().copied().fold(f64::MIN, f64::max);
        // 0.5-wide bins from lo-0.25 so the max count lands inside the range
        let num_bins = ((hi - lo) / 0.5).floor() as usize + 1;
        let (edges, hist) = histogram(&counts, lo - 0.25, 0.5, num_bins);

        let latest = snapshot
            .last()
            .ok_or(PhotodiagError::InsufficientSamples { needed: 1, got: 0 })?;
        let (normalized, smoothed, gradient, peak_indices) = self.shot_analysis(&latest.waveform);

        Ok(PeakCountSummary {
            latest: normalized,
            smoothed,
            gradient,
            peak_indices,
            histogram_edges: edges,
            histogram_counts: hist,
        })
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::gaussian::gaussian_at_zero;
    use approx::assert_relative_eq;

    fn shot(pulse_id: u64, waveform: Vec<f64>, i0: Option<f64>) -> SpectrumShot {
        SpectrumShot {
            pulse_id,
            waveform,
            i0,
        }
    }

    fn lag_axis(n: usize, span: f64) -> Vec<f64> {
        (0..n)
            .map(|i| -span + 2.0 * span * i as f64 / (n - 1) as f64)
            .collect()
    }

    #[test]
    fn lag_axis_recentres_on_middle_sample() {
        let lags = LagAxis::default();
        lags.set_from_axis(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        assert_eq!(lags.get(), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn autocorrelation_summarizer_recovers_widths() {
        let lags = LagAxis::default();
        let axis: Vec<f64> = (0..401).map(|i| i as f64 * 0.15).collect();
        lags.set_from_axis(&axis);
        let lag_values = lags.get();

        let waveform: Vec<f64> = lag_values
            .iter()
            .map(|&x| {
                gaussian_at_zero(x, 5.0, 9.0)
                    + gaussian_at_zero(x, 3.0, 5.0)
                    + gaussian_at_zero(x, 0.5, 0.4)
            })
            .collect();
        let shots: Vec<SpectrumShot> = (0..4)
            .map(|i| shot(i, waveform.clone(), None))
            .collect();

        let mut summarizer = AutocorrelationSummarizer::new(lags, 4);
        let summary = summarizer.summarize(&shots).expect("summary");
        assert!(!summary.is_empty());
        assert_eq!(summary.components.len(), 3);
        let spike = &summary.components[2];
        assert_relative_eq!(spike.source_sigma * 1.4, 0.4, max_relative = 0.1);
        // mean waveform is normalized to its maximum
        let peak = summary
            .mean_waveform
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        assert_relative_eq!(peak, 1.0);
    }

    #[test]
    fn correlation_summarizer_requires_i0() {
        let mut summarizer = SpectrumCorrelationSummarizer::new(3, 3);
        let shots = vec![shot(0, vec![1.0, 2.0], None); 3];
        assert!(summarizer.summarize(&shots).is_err());
    }

    #[test]
    fn correlation_summarizer_tracks_i0_bins() {
        let mut summarizer = SpectrumCorrelationSummarizer::new(3, 3);
        // spectrum scales linearly with i0: full correlation everywhere
        let shots: Vec<SpectrumShot> = (1..=6)
            .map(|i| {
                let v = i as f64;
                shot(i as u64, vec![v, 2.0 * v], Some(v))
            })
            .collect();
        let summary = summarizer.summarize(&shots).expect("summary");
        assert_eq!(summary.correlation.len(), 2);
        assert_relative_eq!(summary.correlation[0], 1.0, epsilon = 1e-12);
        assert_eq!(summary.shots.len(), 6);
        assert!(!summary.min_bin_spectrum.is_empty());
    }

    #[test]
    fn peak_summarizer_counts_paired_edges() {
        // A single clean peak gives two gradient extrema -> count 1.0.
        let lags = lag_axis(201, 10.0);
        let waveform: Vec<f64> = lags
            .iter()
            .map(|&x| (-x * x / 2.0).exp())
            .collect();
        let shots: Vec<SpectrumShot> =
            (0..4).map(|i| shot(i, waveform.clone(), None)).collect();

        let detection = PeakDetection {
            kernel_size: 5,
            min_distance: 10,
            min_height: 0.01,
        };
        let mut summarizer = PeakCountSummarizer::new(detection, 3);
        let summary = summarizer.summarize(&shots).expect("summary");
        assert_eq!(summary.peak_indices.len(), 2);
        // all shots identical: one histogram bin holds everything
        assert_eq!(summary.histogram_counts.iter().sum::<usize>(), 4);
        assert_eq!(summary.histogram_counts[0], 4);
    }

    #[tokio::test]
    async fn spectral_worker_resets_on_axis_change() {
        use crate::mock::MockStreamSource;
        use crate::measurement::{ChannelValue, PulseMessage};
        use std::collections::HashMap;

        let make_msg = |id: u64, axis: Vec<f64>| {
            let mut values = HashMap::new();
            values.insert("AXIS".to_string(), Some(ChannelValue::Waveform(axis)));
            values.insert(
                "SPEC".to_string(),
                Some(ChannelValue::Waveform(vec![1.0, 2.0, 1.0])),
            );
            PulseMessage { pulse_id: id, values }
        };

        let axis_a = vec![1.0, 2.0, 3.0];
        let axis_b = vec![2.0, 3.0, 4.0];
        let messages = vec![
            make_msg(0, axis_a.clone()),
            make_msg(1, axis_a.clone()),
            make_msg(2, axis_b.clone()),
            make_msg(3, axis_b.clone()),
        ];

        let channels = SpectralChannels {
            axis: "AXIS".into(),
            spectrum: "SPEC".into(),
            i0: None,
        };
        let mut session = SpectralSession::new(channels, 10, Duration::from_millis(100));
        let buffer = session.buffer();
        session
            .start(MockStreamSource::from_script(messages))
            .expect("start");

        // The scripted source errors out after the last message; the worker
        // fail-stops, leaving only the shots taken against the final axis.
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should fail-stop");

        let shots = buffer.snapshot();
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].pulse_id, 2);
        assert_eq!(session.lags().get(), vec![-1.0, 0.0, 1.0]);
    }
}
