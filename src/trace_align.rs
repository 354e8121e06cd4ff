//! Sample-level alignment of two traces through their quantized envelopes.
//!
//! Each trace is reduced to one small integer per sample (the tallest channel,
//! quantized to `1..=L`). The two level sequences are aligned with an affine gap
//! dynamic program; long traces are aligned in overlapping chunks which are
//! stitched back together.

use crate::engine::EngineError;
use crate::parameter::AnalysisParameters;
use bio::alignment::pairwise::{Aligner, Scoring};
use bio::alignment::AlignmentOperation;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use tracescan_protocol::Trace;

/// One column of an alignment; `None` on the side that has a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignedPair {
    pub reference: Option<usize>,
    pub input: Option<usize>,
}

impl AlignedPair {
    #[inline(always)]
    pub fn both(reference: usize, input: usize) -> Self {
        Self {
            reference: Some(reference),
            input: Some(input),
        }
    }

    #[inline(always)]
    pub fn reference_only(reference: usize) -> Self {
        Self {
            reference: Some(reference),
            input: None,
        }
    }

    #[inline(always)]
    pub fn input_only(input: usize) -> Self {
        Self {
            reference: None,
            input: Some(input),
        }
    }

    #[inline(always)]
    pub fn is_diagonal(&self) -> bool {
        self.reference.is_some() && self.input.is_some()
    }
}

/// A monotone alignment that visits every sample of both traces exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPath {
    pairs: Vec<AlignedPair>,
    reference_len: usize,
    input_len: usize,
}

impl AlignmentPath {
    pub fn identity(len: usize) -> Self {
        Self {
            pairs: (0..len).map(|k| AlignedPair::both(k, k)).collect(),
            reference_len: len,
            input_len: len,
        }
    }

    /// Repair `pairs` into a complete path: entries that step backwards lose
    /// that side, skipped samples are inserted as gaps.
    pub fn complete(pairs: impl IntoIterator<Item = AlignedPair>, m: usize, n: usize) -> Self {
        let mut out: Vec<AlignedPair> = Vec::with_capacity(m.max(n));
        let (mut next_r, mut next_i) = (0, 0);
        for pair in pairs {
            let r = pair.reference.filter(|&r| r >= next_r && r < m);
            let i = pair.input.filter(|&i| i >= next_i && i < n);
            if r.is_none() && i.is_none() {
                continue;
            }
            if let Some(r) = r {
                out.extend((next_r..r).map(AlignedPair::reference_only));
                next_r = r + 1;
            }
            if let Some(i) = i {
                out.extend((next_i..i).map(AlignedPair::input_only));
                next_i = i + 1;
            }
            out.push(AlignedPair {
                reference: r,
                input: i,
            });
        }
        out.extend((next_r..m).map(AlignedPair::reference_only));
        out.extend((next_i..n).map(AlignedPair::input_only));
        Self {
            pairs: out,
            reference_len: m,
            input_len: n,
        }
    }

    #[inline(always)]
    pub fn pairs(&self) -> &[AlignedPair] {
        &self.pairs
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[inline(always)]
    pub fn reference_len(&self) -> usize {
        self.reference_len
    }

    #[inline(always)]
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Path column of every reference sample.
    pub fn reference_columns(&self) -> Vec<usize> {
        let mut columns = vec![0; self.reference_len];
        for (col, pair) in self.pairs.iter().enumerate() {
            if let Some(r) = pair.reference {
                columns[r] = col;
            }
        }
        columns
    }

    /// Path column of every input sample.
    pub fn input_columns(&self) -> Vec<usize> {
        let mut columns = vec![0; self.input_len];
        for (col, pair) in self.pairs.iter().enumerate() {
            if let Some(i) = pair.input {
                columns[i] = col;
            }
        }
        columns
    }

    pub fn diagonal_fraction(&self) -> f64 {
        diagonal_fraction(&self.pairs)
    }
}

fn diagonal_fraction(pairs: &[AlignedPair]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    pairs.iter().filter(|p| p.is_diagonal()).count() as f64 / pairs.len() as f64
}

/// Input sample aligned with reference sample `r`, or the last input sample
/// seen before it when `r` sits opposite a gap.
fn input_for_reference(pairs: &[AlignedPair], r: usize) -> Option<usize> {
    let mut last = None;
    for pair in pairs {
        if pair.input.is_some() {
            last = pair.input;
        }
        if pair.reference == Some(r) {
            return last;
        }
    }
    None
}

/// Substitution scores over quantization levels `0..=L`.
///
/// Level 0 never occurs in an envelope; its row and column are 0.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentMatrix {
    levels: usize,
    scores: Vec<i32>,
}

impl AlignmentMatrix {
    pub fn new(levels: usize) -> Self {
        let size = levels + 1;
        let mut scores = vec![0; size * size];
        for i in 1..size {
            for j in 1..size {
                scores[i * size + j] = levels as i32 - i.abs_diff(j) as i32;
            }
        }
        Self { levels, scores }
    }

    #[inline(always)]
    pub fn levels(&self) -> usize {
        self.levels
    }

    #[inline(always)]
    pub fn score(&self, a: u8, b: u8) -> i32 {
        self.scores[a as usize * (self.levels + 1) + b as usize]
    }
}

/// Tallest channel at each sample, quantized to levels `1..=levels`.
pub fn build_envelope(trace: &Trace, levels: usize, lower: f64, upper: f64) -> Vec<u8> {
    let top = trace.max_amplitude() as f64;
    let lo = lower * top;
    let hi = upper * top;
    let steps = levels.saturating_sub(1) as f64;
    (0..trace.len())
        .map(|k| {
            if hi <= lo {
                return 1;
            }
            let v = trace.samples.iter().map(|row| row[k]).max().unwrap_or(0) as f64;
            let scaled = (v.clamp(lo, hi) - lo) / (hi - lo) * steps;
            (1.0 + scaled.round()) as u8
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairAlignment {
    pub pairs: Vec<AlignedPair>,
    pub score: i32,
    pub normalized_score: f64,
    pub overlap: f64,
}

/// Align two level sequences; indices in the result are local to `x` and `y`.
pub fn align_levels(
    x: &[u8],
    y: &[u8],
    matrix: &AlignmentMatrix,
    params: &AnalysisParameters,
) -> PairAlignment {
    let match_fn = |a: u8, b: u8| matrix.score(a, b);
    let scoring = Scoring::new(
        -params.gap_open.value(),
        -params.gap_extend.value(),
        match_fn,
    );
    let alignment = if params.edge_scoring_enabled() {
        let mut aligner =
            Aligner::with_capacity_and_scoring(x.len(), y.len(), scoring.xclip(0).yclip(0));
        aligner.custom(x, y)
    } else {
        let mut aligner = Aligner::with_capacity_and_scoring(x.len(), y.len(), scoring);
        aligner.global(x, y)
    };

    let mut pairs = Vec::with_capacity(x.len().max(y.len()));
    let (mut xi, mut yi) = (0, 0);
    for op in &alignment.operations {
        match *op {
            AlignmentOperation::Match | AlignmentOperation::Subst => {
                pairs.push(AlignedPair::both(xi, yi));
                xi += 1;
                yi += 1;
            }
            AlignmentOperation::Ins => {
                pairs.push(AlignedPair::reference_only(xi));
                xi += 1;
            }
            AlignmentOperation::Del => {
                pairs.push(AlignedPair::input_only(yi));
                yi += 1;
            }
            AlignmentOperation::Xclip(len) => {
                pairs.extend((xi..xi + len).map(AlignedPair::reference_only));
                xi += len;
            }
            AlignmentOperation::Yclip(len) => {
                pairs.extend((yi..yi + len).map(AlignedPair::input_only));
                yi += len;
            }
        }
    }
    let path = AlignmentPath::complete(pairs, x.len(), y.len());
    let longest = x.len().max(y.len()).max(1);
    let normalized_score = alignment.score as f64 / (matrix.levels() * longest) as f64;
    PairAlignment {
        overlap: path.diagonal_fraction(),
        pairs: path.pairs,
        score: alignment.score,
        normalized_score,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub index: usize,
    pub reference: Range<usize>,
    pub input: Range<usize>,
    pub score: i32,
    pub normalized_score: f64,
    pub overlap: f64,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceAlignment {
    pub path: AlignmentPath,
    pub chunks: Vec<ChunkReport>,
}

impl TraceAlignment {
    pub fn failed(&self) -> bool {
        self.chunks.iter().any(|c| c.skipped)
    }

    /// Reference samples whose chunk fell below the score threshold.
    pub fn skipped_reference_ranges(&self) -> Vec<Range<usize>> {
        self.chunks
            .iter()
            .filter(|c| c.skipped)
            .map(|c| c.reference.clone())
            .collect()
    }

    pub fn is_skipped(&self, reference_sample: usize) -> bool {
        self.chunks
            .iter()
            .any(|c| c.skipped && c.reference.contains(&reference_sample))
    }

    pub fn warnings(&self) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|c| c.skipped)
            .map(|c| {
                format!(
                    "Alignment chunk {} (reference samples {}..{}) scored {:.3}, below threshold; samples excluded",
                    c.index, c.reference.start, c.reference.end, c.normalized_score
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EnvelopeKey {
    name: String,
    len: usize,
    levels: usize,
    lower: f64,
    upper: f64,
}

/// Score matrix and reference envelope kept between alignments.
///
/// Owned by the caller; one per worker.
#[derive(Debug, Clone, Default)]
pub struct AlignmentCache {
    matrix: Option<AlignmentMatrix>,
    envelope: Option<(EnvelopeKey, Vec<u8>)>,
}

impl AlignmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush(&mut self) {
        self.matrix = None;
        self.envelope = None;
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_none() && self.envelope.is_none()
    }

    fn prepare(
        &mut self,
        reference: &Trace,
        params: &AnalysisParameters,
    ) -> (&AlignmentMatrix, &[u8]) {
        let levels = params.quantisation_levels.value() as usize;
        let key = EnvelopeKey {
            name: reference.name.clone(),
            len: reference.len(),
            levels,
            lower: params.envelope_lower.value(),
            upper: params.envelope_upper.value(),
        };
        if self.matrix.as_ref().is_some_and(|m| m.levels() != levels) {
            self.matrix = None;
        }
        if self.envelope.as_ref().is_some_and(|(k, _)| *k != key) {
            self.envelope = None;
        }
        let matrix = self
            .matrix
            .get_or_insert_with(|| AlignmentMatrix::new(levels));
        let (_, envelope) = self.envelope.get_or_insert_with(|| {
            let envelope = build_envelope(reference, levels, key.lower, key.upper);
            (key, envelope)
        });
        (&*matrix, envelope.as_slice())
    }
}

pub struct TraceAligner<'a> {
    cache: &'a mut AlignmentCache,
    params: &'a AnalysisParameters,
}

impl<'a> TraceAligner<'a> {
    pub fn new(cache: &'a mut AlignmentCache, params: &'a AnalysisParameters) -> Self {
        Self { cache, params }
    }

    pub fn align(&mut self, reference: &Trace, input: &Trace) -> Result<TraceAlignment, EngineError> {
        self.params.validate_alignment()?;
        let params = self.params;
        let levels = params.quantisation_levels.value() as usize;
        let input_envelope = build_envelope(
            input,
            levels,
            params.envelope_lower.value(),
            params.envelope_upper.value(),
        );
        let (matrix, reference_envelope) = self.cache.prepare(reference, params);
        let (m, n) = (reference_envelope.len(), input_envelope.len());
        if m == 0 || n == 0 {
            return Err(EngineError::invalid_input(format!(
                "Cannot align '{}' ({m} samples) with '{}' ({n} samples)",
                reference.name, input.name
            )));
        }

        let chunk = params.chunk_length.value() as usize;
        let overlap = params.chunk_overlap.value() as usize;
        let step = chunk - overlap;
        let threshold = params.alignment_failure_threshold.value();

        let mut stitched: Vec<AlignedPair> = vec![];
        let mut chunks: Vec<ChunkReport> = vec![];
        let (mut r0, mut i0) = (0, 0);
        let mut previous_end = 0;
        loop {
            let last = r0 + chunk >= m || i0 + chunk >= n;
            let (r1, i1) = if last { (m, n) } else { (r0 + chunk, i0 + chunk) };
            let aligned = align_levels(
                &reference_envelope[r0..r1],
                &input_envelope[i0..i1],
                matrix,
                params,
            );
            let skipped = aligned.normalized_score < threshold;
            let local = if skipped {
                diagonal(r1 - r0, i1 - i0)
            } else {
                aligned.pairs
            };
            let pairs: Vec<AlignedPair> = local
                .into_iter()
                .map(|p| AlignedPair {
                    reference: p.reference.map(|r| r + r0),
                    input: p.input.map(|i| i + i0),
                })
                .collect();
            let report = ChunkReport {
                index: chunks.len(),
                reference: r0..r1,
                input: i0..i1,
                score: aligned.score,
                normalized_score: aligned.normalized_score,
                overlap: aligned.overlap,
                skipped,
            };
            if skipped {
                warn!(
                    "Chunk {} of '{}' vs '{}' scored {:.3} (< {threshold}), using a diagonal path",
                    report.index, reference.name, input.name, report.normalized_score
                );
            } else {
                debug!(
                    "Chunk {}: reference {:?} input {:?} score {} normalized {:.3} overlap {:.3}",
                    report.index,
                    report.reference,
                    report.input,
                    report.score,
                    report.normalized_score,
                    report.overlap
                );
            }
            chunks.push(report);

            stitched = if stitched.is_empty() {
                pairs.clone()
            } else {
                stitch(&stitched, &pairs, r0, previous_end)
            };
            if last {
                break;
            }
            let next_r0 = r0 + step;
            let next_i0 = input_for_reference(&pairs, next_r0)
                .unwrap_or(i0 + step)
                .clamp(i0 + 1, n - 1);
            previous_end = r1;
            r0 = next_r0;
            i0 = next_i0;
        }

        Ok(TraceAlignment {
            path: AlignmentPath::complete(stitched, m, n),
            chunks,
        })
    }
}

/// Fallback path for a chunk that could not be aligned.
fn diagonal(m: usize, n: usize) -> Vec<AlignedPair> {
    let shared = m.min(n);
    let mut pairs: Vec<AlignedPair> = (0..shared).map(|k| AlignedPair::both(k, k)).collect();
    pairs.extend((shared..m).map(AlignedPair::reference_only));
    pairs.extend((shared..n).map(AlignedPair::input_only));
    pairs
}

/// Join two chunk paths whose reference windows share `start..end`.
fn stitch(
    previous: &[AlignedPair],
    next: &[AlignedPair],
    start: usize,
    end: usize,
) -> Vec<AlignedPair> {
    let in_overlap = |p: &AlignedPair| {
        p.is_diagonal() && p.reference.is_some_and(|r| (start..end).contains(&r))
    };
    let shared: HashSet<AlignedPair> = previous.iter().copied().filter(in_overlap).collect();

    // Longest run of consecutive diagonal pairs both paths agree on.
    let mut best: Option<(usize, usize)> = None;
    let mut run_start = 0;
    let mut run_len = 0;
    for (idx, pair) in next.iter().enumerate() {
        let extends = run_len > 0
            && next[idx - 1].reference.map(|r| r + 1) == pair.reference
            && next[idx - 1].input.map(|i| i + 1) == pair.input;
        if shared.contains(pair) {
            if extends {
                run_len += 1;
            } else {
                run_start = idx;
                run_len = 1;
            }
            if best.is_none_or(|(_, len)| run_len > len) {
                best = Some((run_start, run_len));
            }
        } else {
            run_len = 0;
        }
    }

    let (previous_cut, next_cut) = match best {
        Some((run_start, run_len)) => {
            let join = next[run_start + run_len / 2];
            let previous_cut = previous
                .iter()
                .position(|p| *p == join)
                .unwrap_or(previous.len());
            (previous_cut, run_start + run_len / 2)
        }
        None => {
            let middle = start + (end.saturating_sub(start)) / 2;
            let at_or_after = |pairs: &[AlignedPair]| {
                pairs
                    .iter()
                    .position(|p| p.reference.is_some_and(|r| r >= middle))
                    .unwrap_or(pairs.len())
            };
            (at_or_after(previous), at_or_after(next))
        }
    };
    previous[..previous_cut]
        .iter()
        .chain(&next[next_cut..])
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TraceBuilder, BASES_50};
    use serde_json::json;

    #[test]
    fn test_alignment_matrix_shape() {
        for levels in [2, 16, 255] {
            let matrix = AlignmentMatrix::new(levels);
            let score = |a: usize, b: usize| matrix.score(a as u8, b as u8);
            for a in 0..=levels {
                assert_eq!(score(0, a), 0);
                assert_eq!(score(a, 0), 0);
                for b in 0..=levels {
                    assert_eq!(score(a, b), score(b, a));
                }
            }
            for a in 1..=levels {
                assert_eq!(score(a, a), levels as i32);
                for b in (a + 1)..levels {
                    assert!(score(a, b) > score(a, b + 1));
                }
            }
        }
    }

    #[test]
    fn test_envelope_levels() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let envelope = build_envelope(&trace, 16, 0.0, 1.0);
        assert_eq!(envelope.len(), trace.len());
        assert!(envelope.iter().all(|&l| (1..=16).contains(&l)));
        assert_eq!(envelope.iter().max(), Some(&16));
        assert_eq!(envelope[0], 1);
        let flat = build_envelope(&trace, 16, 0.5, 0.5);
        assert!(flat.iter().all(|&l| l == 1));
    }

    #[test]
    fn test_complete_repairs_path() {
        let pairs = vec![
            AlignedPair::both(0, 0),
            AlignedPair::both(2, 1),
            AlignedPair::both(1, 3),
            AlignedPair::input_only(2),
        ];
        let path = AlignmentPath::complete(pairs, 4, 4);
        let refs: Vec<usize> = path.pairs().iter().filter_map(|p| p.reference).collect();
        let inputs: Vec<usize> = path.pairs().iter().filter_map(|p| p.input).collect();
        assert_eq!(refs, vec![0, 1, 2, 3]);
        assert_eq!(inputs, vec![0, 1, 2, 3]);
        assert_eq!(path.reference_columns().len(), 4);
    }

    #[test]
    fn test_identical_traces_align_on_diagonal() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let params = AnalysisParameters::default();
        let mut cache = AlignmentCache::new();
        let alignment = TraceAligner::new(&mut cache, &params)
            .align(&trace, &trace)
            .unwrap();
        assert_eq!(alignment.chunks.len(), 1);
        assert!(!alignment.failed());
        assert_eq!(alignment.path, AlignmentPath::identity(trace.len()));
        assert_eq!(alignment.chunks[0].normalized_score, 1.0);
        assert!(!cache.is_empty());
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_chunks_stitch_into_identity() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let mut params = AnalysisParameters::default();
        params.set_by_name("chunk_length", &json!(120)).unwrap();
        params.set_by_name("chunk_overlap", &json!(30)).unwrap();
        let mut cache = AlignmentCache::new();
        let alignment = TraceAligner::new(&mut cache, &params)
            .align(&trace, &trace)
            .unwrap();
        assert!(alignment.chunks.len() > 3);
        assert_eq!(alignment.chunks[1].reference.start, 90);
        assert_eq!(alignment.chunks[1].input.start, 90);
        assert_eq!(alignment.path, AlignmentPath::identity(trace.len()));
    }

    #[test]
    fn test_edge_scoring_keeps_full_path() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let mut params = AnalysisParameters::default();
        params.set_by_name("edge_scoring", &json!(1)).unwrap();
        let mut cache = AlignmentCache::new();
        let alignment = TraceAligner::new(&mut cache, &params)
            .align(&trace, &trace)
            .unwrap();
        assert!(!alignment.failed());
        assert_eq!(alignment.path, AlignmentPath::identity(trace.len()));
        assert_eq!(alignment.chunks[0].normalized_score, 1.0);
    }

    #[test]
    fn test_stitch_without_common_run_cuts_at_overlap_middle() {
        let previous: Vec<AlignedPair> = (0..10).map(|k| AlignedPair::both(k, k)).collect();
        let next: Vec<AlignedPair> = (5..15).map(|k| AlignedPair::both(k, k + 1)).collect();
        let joined = stitch(&previous, &next, 5, 10);
        assert_eq!(joined.len(), 15);
        assert_eq!(joined[6], AlignedPair::both(6, 6));
        assert_eq!(joined[7], AlignedPair::both(7, 8));
        assert_eq!(joined[14], AlignedPair::both(14, 15));
        let refs: Vec<usize> = joined.iter().filter_map(|p| p.reference).collect();
        assert_eq!(refs, (0..15).collect::<Vec<_>>());
    }

    #[test]
    fn test_insertion_opens_input_gap() {
        let reference = TraceBuilder::new("r", BASES_50).build();
        let mut bases: Vec<char> = BASES_50.chars().collect();
        bases.insert(20, 'T');
        let mut heights = crate::test_support::heights(50, 7);
        heights.insert(20, 500);
        let input = TraceBuilder::new("i", &bases.iter().collect::<String>())
            .heights(heights)
            .build();
        let params = AnalysisParameters::default();
        let mut cache = AlignmentCache::new();
        let alignment = TraceAligner::new(&mut cache, &params)
            .align(&reference, &input)
            .unwrap();
        let path = &alignment.path;
        let gaps = path.pairs().iter().filter(|p| p.reference.is_none()).count();
        assert_eq!(gaps, 10);
        assert!(path.pairs().contains(&AlignedPair::both(100, 100)));
        assert!(path.pairs().contains(&AlignedPair::both(400, 410)));
        assert!(alignment.chunks[0].normalized_score > 0.9);
    }

    #[test]
    fn test_low_score_chunk_is_skipped() {
        let reference = TraceBuilder::new("r", BASES_50).build();
        let mut params = AnalysisParameters::default();
        params
            .set_by_name("alignment_failure_threshold", &json!(1.0))
            .unwrap();
        let shifted = TraceBuilder::new("s", &BASES_50[1..]).build();
        let mut cache = AlignmentCache::new();
        let alignment = TraceAligner::new(&mut cache, &params)
            .align(&reference, &shifted)
            .unwrap();
        assert!(alignment.failed());
        assert_eq!(alignment.warnings().len(), 1);
        assert_eq!(alignment.skipped_reference_ranges(), vec![0..reference.len()]);
        assert!(alignment.is_skipped(3));
        assert!(alignment.path.pairs()[..5].iter().all(|p| p.is_diagonal()));
    }
}
