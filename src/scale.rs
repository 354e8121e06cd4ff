//! Amplitude scale between two traces, estimated from matched peak pairs.
//!
//! Ratios `input / reference` are summarised twice. The first pass sets
//! acceptance bounds `mean ± k·stddev`; the second pass summarises only the
//! ratios the first pass accepted.

use crate::preprocess::PeakPair;
use log::debug;
use tracescan_protocol::CHANNELS;

/// Channels with fewer matched pairs fall back to the pooled factors.
pub const MIN_CHANNEL_PAIRS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleStats {
    pub mean: f64,
    pub stddev: f64,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

impl ScaleStats {
    fn from_ratios(ratios: &[f64], k: f64) -> Option<Self> {
        if ratios.is_empty() {
            return None;
        }
        let n = ratios.len() as f64;
        let mean = ratios.iter().sum::<f64>() / n;
        let stddev = (ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
        Some(Self {
            mean,
            stddev,
            lower: mean - k * stddev,
            upper: mean + k * stddev,
            count: ratios.len(),
        })
    }

    #[inline(always)]
    fn accepts(&self, ratio: f64) -> bool {
        self.lower <= ratio && ratio <= self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub first: ScaleStats,
    pub second: ScaleStats,
}

impl ScaleFactors {
    /// `pairs` holds `(reference, input)` amplitudes; pairs with a zero
    /// reference carry no ratio and are ignored.
    pub fn from_pairs(pairs: &[(i32, i32)], k: f64) -> Option<Self> {
        let ratios: Vec<f64> = pairs
            .iter()
            .filter(|(r, _)| *r > 0)
            .map(|&(r, i)| i as f64 / r as f64)
            .collect();
        let first = ScaleStats::from_ratios(&ratios, k)?;
        let kept: Vec<f64> = ratios.iter().copied().filter(|&r| first.accepts(r)).collect();
        // Bounds built from a single ratio still accept it, so `kept` is never empty.
        let second = ScaleStats::from_ratios(&kept, k).unwrap_or(first);
        Some(Self { first, second })
    }

    /// Multiplier that brings reference amplitudes to the input's scale.
    pub fn factor(&self) -> f64 {
        if self.second.mean > 0.0 {
            self.second.mean
        } else {
            1.0
        }
    }
}

/// Per-channel factors, with the pooled factors standing in for sparse channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScale {
    pub pooled: ScaleFactors,
    pub channels: [Option<ScaleFactors>; CHANNELS],
}

impl ChannelScale {
    /// `None` when no peak pair was matched at all.
    pub fn from_matches(matches: &[Vec<PeakPair>; CHANNELS], k: f64) -> Option<Self> {
        let amplitudes = |pairs: &[PeakPair]| -> Vec<(i32, i32)> {
            pairs
                .iter()
                .map(|p| (p.reference_amplitude, p.input_amplitude))
                .collect()
        };
        let all: Vec<(i32, i32)> = matches.iter().flat_map(|m| amplitudes(m)).collect();
        let pooled = ScaleFactors::from_pairs(&all, k)?;
        let channels = std::array::from_fn(|c| {
            if matches[c].len() >= MIN_CHANNEL_PAIRS {
                ScaleFactors::from_pairs(&amplitudes(&matches[c]), k)
            } else {
                None
            }
        });
        let scale = Self { pooled, channels };
        debug!(
            "Scale factors: pooled {:.3} ({} of {} pairs), channels {:?}",
            pooled.factor(),
            pooled.second.count,
            pooled.first.count,
            std::array::from_fn::<f64, CHANNELS, _>(|c| scale.factor(c))
        );
        Some(scale)
    }

    pub fn factors(&self, channel: usize) -> &ScaleFactors {
        self.channels[channel].as_ref().unwrap_or(&self.pooled)
    }

    #[inline(always)]
    pub fn factor(&self, channel: usize) -> f64 {
        self.factors(channel).factor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_pass_excludes_outlier() {
        let mut pairs: Vec<(i32, i32)> = [98, 99, 100, 101, 102, 100, 99, 101, 100]
            .iter()
            .map(|&i| (100, i))
            .collect();
        pairs.push((100, 1000));
        let scale = ScaleFactors::from_pairs(&pairs, 2.0).unwrap();
        assert_eq!(scale.first.count, 10);
        assert_eq!(scale.second.count, 9);
        assert!(scale.second.upper - scale.second.lower < scale.first.upper - scale.first.lower);
        assert!(!scale.second.accepts(10.0));
        assert!((scale.factor() - 1.0).abs() < 0.01);
        assert!(scale.first.mean > 1.8);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(ScaleFactors::from_pairs(&[], 2.0).is_none());
        assert!(ScaleFactors::from_pairs(&[(0, 5)], 2.0).is_none());
        let single = ScaleFactors::from_pairs(&[(200, 100)], 2.0).unwrap();
        assert_eq!(single.second.count, 1);
        assert_eq!(single.factor(), 0.5);
        let zero = ScaleFactors::from_pairs(&[(200, 0), (100, 0)], 2.0).unwrap();
        assert_eq!(zero.factor(), 1.0);
    }

    #[test]
    fn test_sparse_channel_uses_pooled() {
        let pair = |channel: usize, r: i32, i: i32| PeakPair {
            channel,
            reference: 0,
            input: 0,
            reference_amplitude: r,
            input_amplitude: i,
        };
        let matches: [Vec<PeakPair>; CHANNELS] = [
            vec![pair(0, 100, 200), pair(0, 100, 200), pair(0, 100, 200)],
            vec![pair(1, 100, 100)],
            vec![],
            vec![],
        ];
        let scale = ChannelScale::from_matches(&matches, 2.0).unwrap();
        assert_eq!(scale.factor(0), 2.0);
        assert!(scale.channels[1].is_none());
        assert_eq!(scale.factor(1), scale.pooled.factor());
        assert!(ChannelScale::from_matches(&Default::default(), 2.0).is_none());
    }
}
