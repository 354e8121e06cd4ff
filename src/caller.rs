//! Rank the four channels at one column.

use serde::{Deserialize, Serialize};
use tracescan_protocol::{CHANNELS, CHANNEL_BASES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedChannel {
    pub channel: usize,
    /// Column the amplitude was read from; `None` when no peak was found.
    pub position: Option<usize>,
    pub amplitude: i32,
}

impl RankedChannel {
    #[inline(always)]
    pub fn base(&self) -> char {
        CHANNEL_BASES[self.channel]
    }

    #[inline(always)]
    fn key(&self) -> (i32, usize) {
        (self.amplitude, self.channel)
    }
}

/// Five-comparator network, ascending by amplitude then channel.
pub fn rank_sort(ranked: &mut [RankedChannel; CHANNELS]) {
    for (a, b) in [(0, 1), (2, 3), (0, 2), (1, 3), (1, 2)] {
        if ranked[a].key() > ranked[b].key() {
            ranked.swap(a, b);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snr {
    pub ratio: f64,
    pub db: f64,
}

impl Snr {
    pub fn from_amplitudes(top: i32, second: i32) -> Self {
        let ratio = top.max(0) as f64 / (second as f64).max(1.0);
        let db = if ratio > 0.0 { 20.0 * ratio.log10() } else { 0.0 };
        Self { ratio, db }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// Ascending, strongest channel last.
    pub ranked: [RankedChannel; CHANNELS],
    pub valid: bool,
    pub snr: Option<Snr>,
    pub peak_ratio: Option<f64>,
}

impl CallResult {
    #[inline(always)]
    pub fn top(&self) -> &RankedChannel {
        &self.ranked[CHANNELS - 1]
    }

    #[inline(always)]
    pub fn second(&self) -> &RankedChannel {
        &self.ranked[CHANNELS - 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Caller {
    /// Amplitudes at the column.
    Level,
    /// Amplitudes at the column plus the top-two ratio.
    Snr,
    /// Channels without a peak at the column borrow the nearest one within
    /// `window` columns.
    AmbiguityWindow { window: usize },
}

impl Caller {
    /// Rank the channels of `rows` (one row per channel) at `column`.
    pub fn call(&self, rows: &[Vec<i32>], column: usize) -> CallResult {
        debug_assert!(rows.len() >= CHANNELS);
        let at = |c: usize| rows[c].get(column).copied().unwrap_or(0);
        let mut ranked: [RankedChannel; CHANNELS] = std::array::from_fn(|c| RankedChannel {
            channel: c,
            position: Some(column),
            amplitude: at(c),
        });
        if let Self::AmbiguityWindow { window } = *self {
            for entry in ranked.iter_mut() {
                if entry.amplitude > 0 {
                    continue;
                }
                entry.position = nearest_nonzero(&rows[entry.channel], column, window);
                entry.amplitude = entry.position.map_or(0, |p| rows[entry.channel][p]);
            }
        }
        rank_sort(&mut ranked);

        let top = ranked[CHANNELS - 1].amplitude;
        let second = ranked[CHANNELS - 2].amplitude;
        match self {
            Self::Level => CallResult {
                ranked,
                valid: true,
                snr: None,
                peak_ratio: None,
            },
            Self::Snr => CallResult {
                ranked,
                valid: true,
                snr: Some(Snr::from_amplitudes(top, second)),
                peak_ratio: None,
            },
            Self::AmbiguityWindow { .. } => {
                let valid = top > 0;
                CallResult {
                    ranked,
                    valid,
                    snr: None,
                    peak_ratio: Some(if valid {
                        second as f64 / top as f64
                    } else {
                        0.0
                    }),
                }
            }
        }
    }
}

/// Nearest non-zero entry of `row` within `window` of `column`, searching the
/// column itself, then alternately left and right.
pub fn nearest_nonzero(row: &[i32], column: usize, window: usize) -> Option<usize> {
    let hit = |k: usize| row.get(k).is_some_and(|&v| v != 0);
    if hit(column) {
        return Some(column);
    }
    for d in 1..=window {
        if let Some(left) = column.checked_sub(d) {
            if hit(left) {
                return Some(left);
            }
        }
        if hit(column + d) {
            return Some(column + d);
        }
    }
    None
}
