//! Peak finding, noise floor and peak spacing statistics for one trace.

use crate::caller::nearest_nonzero;
use crate::engine::EngineError;
use crate::parameter::AnalysisParameters;
use itertools::{Itertools, MinMaxResult};
use log::debug;
use std::collections::BTreeMap;
use tracescan_protocol::{Trace, CHANNELS};

/// Row of `PeakMatrix` holding 1 where any channel peaks.
pub const OR_ROW: usize = CHANNELS;

/// Per-channel peak amplitudes, 0 where a channel has no peak.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakMatrix {
    rows: [Vec<i32>; CHANNELS + 1],
}

impl PeakMatrix {
    fn new(len: usize) -> Self {
        Self {
            rows: std::array::from_fn(|_| vec![0; len]),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.rows[0].len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn row(&self, row: usize) -> &[i32] {
        &self.rows[row]
    }

    /// The four channel rows, without the OR row.
    #[inline(always)]
    pub fn channel_rows(&self) -> &[Vec<i32>] {
        &self.rows[..CHANNELS]
    }

    #[inline(always)]
    pub fn value(&self, channel: usize, column: usize) -> i32 {
        self.rows[channel].get(column).copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn any_peak(&self, column: usize) -> bool {
        self.value(OR_ROW, column) != 0
    }

    pub fn peak_columns(&self, row: usize) -> Vec<usize> {
        self.rows[row]
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0)
            .map(|(k, _)| k)
            .collect()
    }

    /// Closest peak on `channel` within `window` columns, left first on ties.
    pub fn nearest_peak(&self, channel: usize, column: usize, window: usize) -> Option<usize> {
        nearest_nonzero(&self.rows[channel], column, window)
    }
}

/// Spacing of consecutive OR-row peaks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalStats {
    pub min: usize,
    pub max: usize,
    pub mode: usize,
    pub mean: f64,
    pub stddev: f64,
}

impl IntervalStats {
    /// `None` with fewer than two intervals.
    pub fn from_positions(positions: &[usize]) -> Option<Self> {
        let intervals: Vec<usize> = positions
            .iter()
            .tuple_windows()
            .map(|(a, b)| b - a)
            .collect();
        if intervals.len() < 2 {
            return None;
        }
        let (min, max) = match intervals.iter().copied().minmax() {
            MinMaxResult::MinMax(min, max) => (min, max),
            MinMaxResult::OneElement(v) => (v, v),
            MinMaxResult::NoElements => return None,
        };
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for &interval in &intervals {
            *counts.entry(interval).or_default() += 1;
        }
        // BTreeMap iterates ascending, so the first maximum is the smaller interval.
        let mut mode = min;
        let mut best = 0;
        for (&interval, &count) in &counts {
            if count > best {
                best = count;
                mode = interval;
            }
        }
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<usize>() as f64 / n;
        let variance = intervals
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(Self {
            min,
            max,
            mode,
            mean,
            stddev: variance.sqrt(),
        })
    }
}

/// One reference peak paired with the input peak it was matched to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakPair {
    pub channel: usize,
    pub reference: usize,
    pub input: usize,
    pub reference_amplitude: i32,
    pub input_amplitude: i32,
}

#[derive(Debug, Clone)]
pub struct PreprocessedTrace {
    name: String,
    peaks: PeakMatrix,
    noise_floor: Vec<f64>,
    peak_count: [usize; CHANNELS],
    peak_count_max: usize,
    search_window: usize,
    intervals: IntervalStats,
    region_left: usize,
    region_right: usize,
}

/// Sample range covered by the clip points, widened by half a base spacing.
pub fn clip_region(trace: &Trace) -> (usize, usize) {
    let last_sample = trace.len().saturating_sub(1);
    let kept = trace.kept_bases();
    if kept.is_empty() {
        return (0, last_sample);
    }
    let half = (trace.mean_base_spacing() / 2.0).round() as usize;
    let first = trace.base_positions[kept.start];
    let last = trace.base_positions[kept.end - 1];
    (first.saturating_sub(half), (last + half).min(last_sample))
}

/// Per sample, `threshold` times the strongest sample of any channel within
/// one mean base spacing.
pub fn noise_floor(trace: &Trace, threshold: f64) -> Vec<f64> {
    let len = trace.len();
    let reach = (trace.mean_base_spacing().round() as usize).max(1);
    let column_top: Vec<i32> = (0..len)
        .map(|k| trace.samples.iter().map(|row| row[k]).max().unwrap_or(0))
        .collect();
    (0..len)
        .map(|k| {
            let lo = k.saturating_sub(reach);
            let hi = (k + reach).min(len.saturating_sub(1));
            let envelope = column_top[lo..=hi].iter().copied().max().unwrap_or(0);
            threshold * envelope as f64
        })
        .collect()
}

impl PreprocessedTrace {
    pub fn from_clip(trace: &Trace, params: &AnalysisParameters) -> Result<Self, EngineError> {
        let (left, right) = clip_region(trace);
        Self::from_trace(trace, left, right, params)
    }

    /// Find peaks of `trace` inside `region_left..=region_right`.
    pub fn from_trace(
        trace: &Trace,
        region_left: usize,
        region_right: usize,
        params: &AnalysisParameters,
    ) -> Result<Self, EngineError> {
        let len = trace.len();
        if len == 0 {
            return Err(EngineError::invalid_input(format!(
                "Trace '{}' has no samples",
                trace.name
            )));
        }
        let region_right = region_right.min(len - 1);
        if region_left > region_right {
            return Err(EngineError::invalid_input(format!(
                "Trace '{}' region {region_left}..{region_right} is empty",
                trace.name
            )));
        }

        let noise_floor = noise_floor(trace, params.noise_threshold.value());

        let mut peaks = PeakMatrix::new(len);
        let mut peak_count = [0; CHANNELS];
        let first = region_left.max(1);
        let last = region_right.min(len.saturating_sub(2));
        for k in first..=last {
            for (c, row) in trace.samples.iter().enumerate() {
                let x = row[k];
                let is_peak = x > row[k - 1] && x >= row[k + 1] && x > 0;
                if is_peak && x as f64 > noise_floor[k] {
                    peaks.rows[c][k] = x;
                    peaks.rows[OR_ROW][k] = 1;
                    peak_count[c] += 1;
                }
            }
        }
        let peak_count_max = peak_count.iter().copied().max().unwrap_or(0);

        let or_positions = peaks.peak_columns(OR_ROW);
        let intervals = IntervalStats::from_positions(&or_positions).ok_or_else(|| {
            EngineError::invalid_input(format!(
                "Trace '{}' has {} peaks in samples {region_left}..={region_right}, at least 3 needed",
                trace.name,
                or_positions.len()
            ))
        })?;
        let search_window =
            ((intervals.mean * params.peak_search_window.value()).round() as usize).max(1);

        debug!(
            "Trace '{}': peaks {:?} in {}..={}, interval mean {:.2} sd {:.2} mode {}, window {}",
            trace.name,
            peak_count,
            region_left,
            region_right,
            intervals.mean,
            intervals.stddev,
            intervals.mode,
            search_window
        );

        Ok(Self {
            name: trace.name.clone(),
            peaks,
            noise_floor,
            peak_count,
            peak_count_max,
            search_window,
            intervals,
            region_left,
            region_right,
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn peaks(&self) -> &PeakMatrix {
        &self.peaks
    }

    #[inline(always)]
    pub fn noise_floor(&self) -> &[f64] {
        &self.noise_floor
    }

    #[inline(always)]
    pub fn peak_count(&self) -> [usize; CHANNELS] {
        self.peak_count
    }

    #[inline(always)]
    pub fn peak_count_max(&self) -> usize {
        self.peak_count_max
    }

    #[inline(always)]
    pub fn search_window(&self) -> usize {
        self.search_window
    }

    #[inline(always)]
    pub fn intervals(&self) -> &IntervalStats {
        &self.intervals
    }

    #[inline(always)]
    pub fn region(&self) -> (usize, usize) {
        (self.region_left, self.region_right)
    }

    #[inline(always)]
    pub fn in_region(&self, column: usize) -> bool {
        (self.region_left..=self.region_right).contains(&column)
    }

    /// Pair every reference peak with the nearest unused input peak on the same
    /// channel. The window is always this trace's.
    pub fn match_peaks(&self, input: &PreprocessedTrace) -> [Vec<PeakPair>; CHANNELS] {
        let window = self.search_window;
        std::array::from_fn(|channel| {
            let candidates = input.peaks.peak_columns(channel);
            let mut used = vec![false; candidates.len()];
            let mut pairs = vec![];
            for reference in self.peaks.peak_columns(channel) {
                let lo = candidates.partition_point(|&p| p + window < reference);
                let mut best: Option<(usize, usize)> = None;
                for (idx, &col) in candidates.iter().enumerate().skip(lo) {
                    if col > reference + window {
                        break;
                    }
                    if used[idx] {
                        continue;
                    }
                    let distance = col.abs_diff(reference);
                    // Ascending scan keeps the left candidate on equal distance.
                    if best.is_none_or(|(_, d)| distance < d) {
                        best = Some((idx, distance));
                    }
                }
                if let Some((idx, _)) = best {
                    used[idx] = true;
                    let col = candidates[idx];
                    pairs.push(PeakPair {
                        channel,
                        reference,
                        input: col,
                        reference_amplitude: self.peaks.value(channel, reference),
                        input_amplitude: input.peaks.value(channel, col),
                    });
                }
            }
            pairs
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorCode;
    use crate::test_support::{base_sample, TraceBuilder, BASES_50, SPACING};

    #[test]
    fn test_peaks_at_base_positions() {
        let trace = TraceBuilder::new("ref", BASES_50).build();
        let params = AnalysisParameters::default();
        let pre = PreprocessedTrace::from_clip(&trace, &params).unwrap();
        assert_eq!(pre.peak_count().iter().sum::<usize>(), 50);
        assert_eq!(pre.peaks().peak_columns(OR_ROW), trace.base_positions);
        for (i, base) in BASES_50.chars().enumerate() {
            let c = tracescan_protocol::base_channel(base).unwrap();
            assert!(pre.peaks().value(c, base_sample(i)) > 0);
        }
        assert_eq!(pre.intervals().mode, 10);
        assert_eq!(pre.intervals().min, 10);
        assert_eq!(pre.intervals().stddev, 0.0);
        assert_eq!(pre.search_window(), 5);
        assert_eq!(pre.region(), (5, base_sample(49) + 5));
    }

    #[test]
    fn test_noise_floor_removes_small_peaks() {
        // A 10% shoulder under a full peak on another channel.
        let trace = TraceBuilder::new("t", &BASES_50[..20])
            .mix(5, [1000, 100, 0, 0])
            .build();
        let params = AnalysisParameters::default();
        let pre = PreprocessedTrace::from_clip(&trace, &params).unwrap();
        assert!(pre.peaks().value(0, base_sample(5)) > 0);
        assert_eq!(pre.peaks().value(1, base_sample(5)), 0);
        assert!(pre.noise_floor()[base_sample(5)] > 100.0);
    }

    #[test]
    fn test_baseline_noise_is_not_a_peak() {
        let clean = TraceBuilder::new("clean", BASES_50).build();
        let mut noisy = clean.clone();
        let mut x: u64 = 11;
        for row in noisy.samples.iter_mut() {
            for v in row.iter_mut() {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                *v += ((x >> 33) % 8) as i32;
            }
        }
        let params = AnalysisParameters::default();
        let pre_clean = PreprocessedTrace::from_clip(&clean, &params).unwrap();
        let pre_noisy = PreprocessedTrace::from_clip(&noisy, &params).unwrap();
        assert_eq!(pre_noisy.peak_count(), pre_clean.peak_count());
        assert_eq!(pre_noisy.peaks().peak_columns(OR_ROW), clean.base_positions);
        assert_eq!(pre_noisy.search_window(), 5);
        assert_eq!(pre_noisy.intervals().mean, 10.0);
        // Between two peaks the floor follows their envelope.
        let between = base_sample(10) + SPACING / 2;
        assert!(pre_noisy.noise_floor()[between] > 50.0);
    }

    #[test]
    fn test_too_few_peaks() {
        let trace = TraceBuilder::new("flat", "AC").build();
        let params = AnalysisParameters::default();
        let err = PreprocessedTrace::from_trace(&trace, 0, 100, &params).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("flat"));
    }

    #[test]
    fn test_interval_stats_mode_prefers_smaller() {
        let stats = IntervalStats::from_positions(&[0, 10, 20, 32, 44]).unwrap();
        assert_eq!(stats.mode, 10);
        assert_eq!(stats.min, 10);
        assert_eq!(stats.max, 12);
        assert_eq!(stats.mean, 11.0);
        assert_eq!(stats.stddev, 1.0);
        assert!(IntervalStats::from_positions(&[3, 9]).is_none());
    }

    #[test]
    fn test_match_peaks_greedy_left_on_ties() {
        let params = AnalysisParameters::default();
        let reference = TraceBuilder::new("r", BASES_50).build();
        let pre_ref = PreprocessedTrace::from_clip(&reference, &params).unwrap();
        let pre_in = PreprocessedTrace::from_clip(&reference, &params).unwrap();
        let pairs = pre_ref.match_peaks(&pre_in);
        let total: usize = pairs.iter().map(|p| p.len()).sum();
        assert_eq!(total, 50);
        assert!(pairs.iter().flatten().all(|p| p.reference == p.input));

        let mut shifted = PeakMatrix::new(40);
        shifted.rows[0][20] = 1;
        let window = 2;
        assert_eq!(shifted.nearest_peak(0, 21, window), Some(20));
        shifted.rows[0][22] = 1;
        assert_eq!(shifted.nearest_peak(0, 21, window), Some(20));
        assert_eq!(shifted.nearest_peak(0, 25, window), None);
    }
}
