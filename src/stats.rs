//! Statistical aggregation applied to buffer snapshots on each refresh tick.
//!
//! Everything here is recomputed from scratch on every tick from the current
//! snapshot; nothing is updated incrementally. Standard deviations are
//! population deviations (divide by N), matching the convention of the
//! upstream processing pipeline.

use crate::error::{AppResult, PhotodiagError};
use crate::measurement::{Parity, StreamRecord};

/// Split records into (even, odd) parity buckets.
///
/// The split is exhaustive and disjoint: every record lands in exactly one
/// bucket.
pub fn split_by_parity(records: &[StreamRecord]) -> (Vec<StreamRecord>, Vec<StreamRecord>) {
    records
        .iter()
        .cloned()
        .partition(|r| r.parity == Parity::Even)
}

/// Mean and population standard deviation of a sample.
///
/// Returns `(0.0, 0.0)` for an empty sample; callers gate on minimum sample
/// counts before interpreting the result.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Per-channel mean and standard deviation over a set of records.
///
/// All records must share the same arity.
pub fn per_channel_mean_std(records: &[StreamRecord]) -> AppResult<(Vec<f64>, Vec<f64>)> {
    let Some(first) = records.first() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let arity = first.values.len();
    let mut means = Vec::with_capacity(arity);
    let mut stds = Vec::with_capacity(arity);
    for ch in 0..arity {
        let column: Vec<f64> = records
            .iter()
            .map(|r| {
                r.values.get(ch).copied().ok_or(PhotodiagError::ShapeMismatch {
                    expected: arity,
                    got: r.values.len(),
                })
            })
            .collect::<AppResult<_>>()?;
        let (m, s) = mean_std(&column);
        means.push(m);
        stds.push(s);
    }
    Ok((means, stds))
}

/// Extract one value column from a set of records.
pub fn column(records: &[StreamRecord], index: usize) -> Vec<f64> {
    records
        .iter()
        .filter_map(|r| r.values.get(index).copied())
        .collect()
}

/// Pearson correlation coefficient of two equal-length samples.
///
/// Returns an error on a length mismatch or fewer than two points; returns
/// `0.0` when either sample has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> AppResult<f64> {
    if x.len() != y.len() {
        return Err(PhotodiagError::ShapeMismatch {
            expected: x.len(),
            got: y.len(),
        });
    }
    if x.len() < 2 {
        return Err(PhotodiagError::InsufficientSamples {
            needed: 2,
            got: x.len(),
        });
    }
    let (mx, _) = mean_std(x);
    let (my, _) = mean_std(y);
    let mut num = 0.0;
    let mut dx2 = 0.0;
    let mut dy2 = 0.0;
    for (a, b) in x.iter().zip(y) {
        num += (a - mx) * (b - my);
        dx2 += (a - mx).powi(2);
        dy2 += (b - my).powi(2);
    }
    let denom = (dx2 * dy2).sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok(num / denom)
}

/// Per-bin Pearson correlation of a stack of spectra against the I0 signal.
///
/// `spectra` is shot-major (one inner slice per shot); the result has one
/// coefficient per wavelength bin. Bins where the spectra have zero variance
/// across shots yield `0.0`.
pub fn pearson_per_bin(spectra: &[Vec<f64>], i0: &[f64]) -> AppResult<Vec<f64>> {
    if spectra.len() != i0.len() {
        return Err(PhotodiagError::ShapeMismatch {
            expected: spectra.len(),
            got: i0.len(),
        });
    }
    let Some(first) = spectra.first() else {
        return Ok(Vec::new());
    };
    let bins = first.len();
    let mut result = Vec::with_capacity(bins);
    for bin in 0..bins {
        let column: Vec<f64> = spectra
            .iter()
            .map(|shot| {
                shot.get(bin).copied().ok_or(PhotodiagError::ShapeMismatch {
                    expected: bins,
                    got: shot.len(),
                })
            })
            .collect::<AppResult<_>>()?;
        result.push(pearson(&column, i0)?);
    }
    Ok(result)
}

/// Mean spectrum per I0 bin.
///
/// `bin_edges` are the lower edges of half-open bins; shots whose I0 falls
/// below the first edge are discarded, shots at or above the last edge go to
/// the last bin. Empty bins produce a zero spectrum.
pub fn bin_spectra_by_i0(
    i0: &[f64],
    bin_edges: &[f64],
    spectra: &[Vec<f64>],
) -> AppResult<Vec<Vec<f64>>> {
    if spectra.len() != i0.len() {
        return Err(PhotodiagError::ShapeMismatch {
            expected: spectra.len(),
            got: i0.len(),
        });
    }
    let Some(first) = spectra.first() else {
        return Ok(vec![Vec::new(); bin_edges.len()]);
    };
    let bins = first.len();

    let mut sums = vec![vec![0.0; bins]; bin_edges.len()];
    let mut counts = vec![0usize; bin_edges.len()];
    for (value, shot) in i0.iter().zip(spectra) {
        if shot.len() != bins {
            return Err(PhotodiagError::ShapeMismatch {
                expected: bins,
                got: shot.len(),
            });
        }
        let Some(idx) = bin_index(*value, bin_edges) else {
            continue;
        };
        counts[idx] += 1;
        for (acc, v) in sums[idx].iter_mut().zip(shot) {
            *acc += v;
        }
    }

    Ok(sums
        .into_iter()
        .zip(&counts)
        .map(|(sum, &count)| {
            if count == 0 {
                vec![0.0; bins]
            } else {
                sum.into_iter().map(|v| v / count as f64).collect()
            }
        })
        .collect())
}

fn bin_index(value: f64, edges: &[f64]) -> Option<usize> {
    let mut idx = None;
    for (i, edge) in edges.iter().enumerate() {
        if value >= *edge {
            idx = Some(i);
        }
    }
    idx
}

/// Evenly spaced I0 bin edges spanning the observed range.
pub fn i0_bin_edges(i0: &[f64], num_bins: usize) -> Vec<f64> {
    let Some(lo) = i0.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let hi = i0.iter().copied().fold(lo, f64::max);
    if num_bins == 0 || hi <= lo {
        return vec![lo];
    }
    let step = (hi - lo) / num_bins as f64;
    (0..num_bins).map(|i| lo + step * i as f64).collect()
}

/// `same`-mode convolution of a signal with a normalized box kernel.
pub fn box_smooth(signal: &[f64], kernel_size: usize) -> Vec<f64> {
    if kernel_size <= 1 || signal.is_empty() {
        return signal.to_vec();
    }
    let n = signal.len();
    let k = kernel_size;
    let half = k / 2;
    let mut out = vec![0.0; n];
    for (i, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for j in 0..k {
            // same-mode alignment: kernel centered on i, zero-padded edges
            let idx = i as isize + j as isize - half as isize;
            if idx >= 0 && (idx as usize) < n {
                acc += signal[idx as usize];
            }
        }
        *slot = acc / k as f64;
    }
    out
}

/// Absolute central-difference gradient of a signal.
pub fn abs_gradient(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    out[0] = (signal[1] - signal[0]).abs();
    out[n - 1] = (signal[n - 1] - signal[n - 2]).abs();
    for i in 1..n - 1 {
        out[i] = ((signal[i + 1] - signal[i - 1]) / 2.0).abs();
    }
    out
}

/// Indices of local maxima at least `min_height` tall and `min_distance`
/// samples apart.
///
/// When two peaks are closer than `min_distance`, the taller one wins,
/// the same selection rule scipy's `find_peaks` applies.
pub fn find_peaks(signal: &[f64], min_distance: usize, min_height: f64) -> Vec<usize> {
    let mut candidates: Vec<usize> = Vec::new();
    for i in 1..signal.len().saturating_sub(1) {
        if signal[i] > signal[i - 1] && signal[i] >= signal[i + 1] && signal[i] >= min_height {
            candidates.push(i);
        }
    }
    if min_distance <= 1 {
        return candidates;
    }

    // Keep tallest first, reject anything within min_distance of a keeper.
    let mut by_height = candidates.clone();
    by_height.sort_by(|a, b| {
        signal[*b]
            .partial_cmp(&signal[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<usize> = Vec::new();
    for idx in by_height {
        if kept
            .iter()
            .all(|k| k.abs_diff(idx) >= min_distance)
        {
            kept.push(idx);
        }
    }
    kept.sort_unstable();
    kept
}

/// Histogram with fixed-width bins; returns `(left_edges, counts)`.
pub fn histogram(values: &[f64], bin_start: f64, bin_width: f64, num_bins: usize) -> (Vec<f64>, Vec<usize>) {
    let mut counts = vec![0usize; num_bins];
    for v in values {
        let offset = (v - bin_start) / bin_width;
        if offset >= 0.0 && (offset as usize) < num_bins {
            counts[offset as usize] += 1;
        }
    }
    let edges = (0..num_bins)
        .map(|i| bin_start + bin_width * i as f64)
        .collect();
    (edges, counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn records(ids: &[u64]) -> Vec<StreamRecord> {
        ids.iter()
            .map(|&id| StreamRecord::new(id, vec![id as f64]))
            .collect()
    }

    #[test]
    fn parity_split_is_exhaustive_and_disjoint() {
        let recs = records(&[0, 1, 2, 3, 4, 5, 6]);
        let (even, odd) = split_by_parity(&recs);
        assert_eq!(even.len() + odd.len(), recs.len());
        assert!(even.iter().all(|r| r.pulse_id % 2 == 0));
        assert!(odd.iter().all(|r| r.pulse_id % 2 == 1));
    }

    #[test]
    fn mean_std_population_convention() {
        let (mean, std) = mean_std(&[1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(mean, 2.5);
        assert_relative_eq!(std, (1.25f64).sqrt());
    }

    #[test]
    fn constant_sample_has_zero_std() {
        let (mean, std) = mean_std(&[1.0; 10]);
        assert_relative_eq!(mean, 1.0);
        assert_relative_eq!(std, 0.0);
    }

    #[test]
    fn per_channel_stats_follow_columns() {
        let recs = vec![
            StreamRecord::new(0, vec![1.0, 10.0]),
            StreamRecord::new(1, vec![3.0, 10.0]),
        ];
        let (means, stds) = per_channel_mean_std(&recs).expect("stats");
        assert_relative_eq!(means[0], 2.0);
        assert_relative_eq!(means[1], 10.0);
        assert_relative_eq!(stds[0], 1.0);
        assert_relative_eq!(stds[1], 0.0);
    }

    #[test]
    fn pearson_detects_perfect_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert_relative_eq!(pearson(&x, &y).expect("pearson"), 1.0);
        let y_neg: Vec<f64> = y.iter().map(|v| -v).collect();
        assert_relative_eq!(pearson(&x, &y_neg).expect("pearson"), -1.0);
    }

    #[test]
    fn pearson_zero_variance_yields_zero() {
        let x = [1.0, 1.0, 1.0];
        let y = [1.0, 2.0, 3.0];
        assert_relative_eq!(pearson(&x, &y).expect("pearson"), 0.0);
    }

    #[test]
    fn pearson_per_bin_tracks_correlated_bins() {
        // Bin 0 follows I0 exactly, bin 1 is anti-correlated, bin 2 constant.
        let i0 = vec![1.0, 2.0, 3.0];
        let spectra = vec![
            vec![1.0, -1.0, 5.0],
            vec![2.0, -2.0, 5.0],
            vec![3.0, -3.0, 5.0],
        ];
        let coeffs = pearson_per_bin(&spectra, &i0).expect("coeffs");
        assert_relative_eq!(coeffs[0], 1.0);
        assert_relative_eq!(coeffs[1], -1.0);
        assert_relative_eq!(coeffs[2], 0.0);
    }

    #[test]
    fn binning_averages_within_bins_and_zero_fills_empty() {
        let i0 = vec![0.1, 0.9, 1.1];
        let spectra = vec![vec![2.0, 0.0], vec![4.0, 0.0], vec![10.0, 10.0]];
        let edges = vec![0.0, 1.0, 2.0];
        let binned = bin_spectra_by_i0(&i0, &edges, &spectra).expect("binned");
        assert_eq!(binned.len(), 3);
        assert_relative_eq!(binned[0][0], 3.0);
        assert_relative_eq!(binned[1][0], 10.0);
        assert_eq!(binned[2], vec![0.0, 0.0]);
    }

    #[test]
    fn box_smooth_preserves_constant_signals() {
        let smoothed = box_smooth(&[1.0; 9], 3);
        // Interior samples keep the value; edges see zero padding.
        assert_relative_eq!(smoothed[4], 1.0);
        assert_relative_eq!(smoothed[0], 2.0 / 3.0);
    }

    #[test]
    fn find_peaks_enforces_height_and_distance() {
        let signal = [0.0, 1.0, 0.0, 0.2, 0.0, 3.0, 0.0, 2.0, 0.0];
        // height filter removes the 0.2 bump
        let peaks = find_peaks(&signal, 1, 0.5);
        assert_eq!(peaks, vec![1, 5, 7]);
        // distance filter keeps the tallest of the close pair (5 and 7)
        let peaks = find_peaks(&signal, 3, 0.5);
        assert_eq!(peaks, vec![1, 5]);
    }

    #[test]
    fn histogram_counts_land_in_half_open_bins() {
        let (edges, counts) = histogram(&[0.5, 1.0, 1.4, 2.0, -1.0], 0.25, 0.5, 4);
        assert_eq!(edges.len(), 4);
        assert_relative_eq!(edges[0], 0.25);
        // -1.0 falls below the first bin and is discarded
        assert_eq!(counts, vec![1, 1, 1, 1]);
    }
}
