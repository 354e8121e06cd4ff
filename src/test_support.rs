//! Synthetic chromatograms for unit tests.

use tracescan_protocol::{base_channel, Strand, Trace, CHANNELS};

pub const SPACING: usize = 10;
pub const OFFSET: usize = 10;
const SIGMA: f64 = 2.0;
const REACH: i64 = 6;

/// Fifty bases with no long repeats.
pub const BASES_50: &str = "ACGTTGCAAGTCCTAGGATCGATCCGTAAGCTTGACGGTACATGCAGTCA";

/// Deterministic, non-periodic peak heights between 400 and 999.
pub fn heights(n: usize, seed: u64) -> Vec<i32> {
    let mut x = seed;
    (0..n)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            400 + ((x >> 33) % 600) as i32
        })
        .collect()
}

pub fn substitute(base: char) -> char {
    match base {
        'A' => 'G',
        'C' => 'T',
        'G' => 'A',
        _ => 'C',
    }
}

/// Sample index of base `i`.
pub fn base_sample(i: usize) -> usize {
    OFFSET + SPACING * i
}

pub struct TraceBuilder {
    name: String,
    bases: Vec<char>,
    heights: Vec<i32>,
    mixes: Vec<(usize, [i32; CHANNELS])>,
    strand: Strand,
}

impl TraceBuilder {
    pub fn new(name: &str, bases: &str) -> Self {
        let bases: Vec<char> = bases.chars().collect();
        let heights = heights(bases.len(), 7);
        Self {
            name: name.to_string(),
            bases,
            heights,
            mixes: vec![],
            strand: Strand::Forward,
        }
    }

    pub fn heights(mut self, heights: Vec<i32>) -> Self {
        self.heights = heights;
        self
    }

    /// Replace the single peak of base `index` by one peak per channel.
    pub fn mix(mut self, index: usize, amplitudes: [i32; CHANNELS]) -> Self {
        self.mixes.push((index, amplitudes));
        self
    }

    pub fn strand(mut self, strand: Strand) -> Self {
        self.strand = strand;
        self
    }

    pub fn build(self) -> Trace {
        let n = self.bases.len();
        let len = 2 * OFFSET + SPACING * n.saturating_sub(1) + 1;
        let mut samples: [Vec<i32>; CHANNELS] = std::array::from_fn(|_| vec![0; len]);
        for (i, &base) in self.bases.iter().enumerate() {
            let mut amplitudes = [0; CHANNELS];
            if let Some(c) = base_channel(base) {
                amplitudes[c] = self.heights[i];
            }
            if let Some((_, mix)) = self.mixes.iter().find(|(idx, _)| *idx == i) {
                amplitudes = *mix;
            }
            let centre = base_sample(i) as i64;
            for (c, &h) in amplitudes.iter().enumerate() {
                if h == 0 {
                    continue;
                }
                for d in -REACH..=REACH {
                    let k = (centre + d) as usize;
                    let g = (-(d * d) as f64 / (2.0 * SIGMA * SIGMA)).exp();
                    samples[c][k] += (h as f64 * g).round() as i32;
                }
            }
        }
        Trace {
            name: self.name,
            samples,
            bases: self.bases.iter().collect(),
            base_positions: (0..n).map(base_sample).collect(),
            clip_left: 0,
            clip_right: n + 1,
            strand: self.strand,
        }
    }
}
