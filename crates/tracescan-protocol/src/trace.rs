use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const CHANNELS: usize = 4;

/// Channel order used by every sample array, peak matrix and call.
pub const CHANNEL_BASES: [char; CHANNELS] = ['A', 'C', 'G', 'T'];

/// Placeholder base written opposite an insertion in a co-registered trace.
pub const PAD_BASE: char = '*';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

impl Strand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

/// A decoded chromatogram.
///
/// Clip points use 1-based base numbers with exclusive bounds: the kept bases
/// are numbers `clip_left + 1 ..= clip_right - 1`, so `clip_left == 0` keeps
/// everything from the first base on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trace {
    pub name: String,
    /// Amplitudes for A, C, G and T, all of the same length.
    pub samples: [Vec<i32>; CHANNELS],
    pub bases: String,
    /// Sample index of each called base.
    pub base_positions: Vec<usize>,
    pub clip_left: usize,
    pub clip_right: usize,
    pub strand: Strand,
}

impl Trace {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.samples[0].len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn num_bases(&self) -> usize {
        self.base_positions.len()
    }

    pub fn base_chars(&self) -> Vec<char> {
        self.bases.chars().collect()
    }

    pub fn base_at(&self, index: usize) -> Option<char> {
        self.bases.chars().nth(index)
    }

    pub fn max_amplitude(&self) -> i32 {
        self.samples
            .iter()
            .flat_map(|row| row.iter().copied())
            .max()
            .unwrap_or(0)
    }

    /// Number of bases between the clip points; negative when the clip points
    /// are crossed.
    pub fn clip_span(&self) -> i64 {
        self.clip_right as i64 - self.clip_left as i64 - 1
    }

    /// 0-based indices of the bases kept by the clip points.
    pub fn kept_bases(&self) -> Range<usize> {
        let end = self.clip_right.saturating_sub(1).min(self.num_bases());
        self.clip_left.min(end)..end
    }

    /// Index of the base whose position is closest to `sample`, earlier base
    /// on ties.
    pub fn nearest_base(&self, sample: usize) -> Option<usize> {
        if self.base_positions.is_empty() {
            return None;
        }
        let idx = self.base_positions.partition_point(|&p| p < sample);
        if idx == 0 {
            return Some(0);
        }
        if idx == self.base_positions.len() {
            return Some(idx - 1);
        }
        let before = sample - self.base_positions[idx - 1];
        let after = self.base_positions[idx] - sample;
        if before <= after {
            Some(idx - 1)
        } else {
            Some(idx)
        }
    }

    /// Average number of samples between consecutive bases.
    pub fn mean_base_spacing(&self) -> f64 {
        match (self.base_positions.first(), self.base_positions.last()) {
            (Some(first), Some(last)) if self.base_positions.len() > 1 => {
                (last - first) as f64 / (self.base_positions.len() - 1) as f64
            }
            _ => 0.0,
        }
    }
}

#[inline(always)]
pub fn base_channel(base: char) -> Option<usize> {
    match base.to_ascii_uppercase() {
        'A' => Some(0),
        'C' => Some(1),
        'G' => Some(2),
        'T' | 'U' => Some(3),
        _ => None,
    }
}

/// Complement of a base letter, IUPAC ambiguity codes included. Pads and
/// unknown letters are returned unchanged.
pub fn complement_base(base: char) -> char {
    match base {
        'A' => 'T',
        'C' => 'G',
        'G' => 'C',
        'T' | 'U' => 'A',
        'K' => 'M',
        'M' => 'K',
        'R' => 'Y',
        'Y' => 'R',
        'B' => 'V',
        'V' => 'B',
        'D' => 'H',
        'H' => 'D',
        'a' => 't',
        'c' => 'g',
        'g' => 'c',
        't' | 'u' => 'a',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with_positions(positions: &[usize]) -> Trace {
        Trace {
            name: "t".to_string(),
            samples: [vec![0; 100], vec![0; 100], vec![0; 100], vec![0; 100]],
            bases: "A".repeat(positions.len()),
            base_positions: positions.to_vec(),
            clip_left: 0,
            clip_right: positions.len() + 1,
            strand: Strand::Forward,
        }
    }

    #[test]
    fn test_nearest_base() {
        let trace = trace_with_positions(&[10, 20, 30]);
        assert_eq!(trace.nearest_base(0), Some(0));
        assert_eq!(trace.nearest_base(14), Some(0));
        assert_eq!(trace.nearest_base(15), Some(0));
        assert_eq!(trace.nearest_base(16), Some(1));
        assert_eq!(trace.nearest_base(99), Some(2));
        assert_eq!(trace_with_positions(&[]).nearest_base(5), None);
    }

    #[test]
    fn test_kept_bases_and_span() {
        let mut trace = trace_with_positions(&[10, 20, 30, 40, 50]);
        assert_eq!(trace.kept_bases(), 0..5);
        assert_eq!(trace.clip_span(), 5);
        trace.clip_left = 1;
        trace.clip_right = 4;
        assert_eq!(trace.kept_bases(), 1..3);
        assert_eq!(trace.clip_span(), 2);
        trace.clip_right = 1;
        assert_eq!(trace.clip_span(), -1);
    }

    #[test]
    fn test_complement_base() {
        assert_eq!(complement_base('A'), 'T');
        assert_eq!(complement_base('R'), 'Y');
        assert_eq!(complement_base('S'), 'S');
        assert_eq!(complement_base('W'), 'W');
        assert_eq!(complement_base(PAD_BASE), PAD_BASE);
        assert_eq!(base_channel('g'), Some(2));
        assert_eq!(base_channel('N'), None);
    }

    #[test]
    fn test_trace_json_defaults() {
        let trace: Trace = serde_json::from_str(r#"{"name":"x","bases":"AC"}"#).unwrap();
        assert_eq!(trace.name, "x");
        assert!(trace.is_empty());
        assert_eq!(trace.strand, Strand::Forward);
    }
}
