//! Bring an aligned input trace back to base and sample level.

use crate::engine::EngineError;
use crate::parameter::AnalysisParameters;
use crate::trace_align::{
    AlignedPair, AlignmentCache, AlignmentPath, TraceAligner, TraceAlignment,
};
use log::debug;
use serde::{Deserialize, Serialize};
use tracescan_protocol::{Trace, CHANNELS, PAD_BASE};

/// A base placed on the alignment path; pads have no `index`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignedBase {
    pub base: char,
    pub column: usize,
    /// Index into the original trace's base list.
    pub index: Option<usize>,
}

impl AlignedBase {
    fn pad(column: usize) -> Self {
        Self {
            base: PAD_BASE,
            column,
            index: None,
        }
    }

    #[inline(always)]
    pub fn is_pad(&self) -> bool {
        self.index.is_none()
    }
}

/// Reference and input base streams of equal length, entry `k` of one
/// opposite entry `k` of the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoRegisteredBases {
    pub reference: Vec<AlignedBase>,
    pub input: Vec<AlignedBase>,
}

impl CoRegisteredBases {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    pub fn reference_string(&self) -> String {
        self.reference.iter().map(|b| b.base).collect()
    }

    pub fn input_string(&self) -> String {
        self.input.iter().map(|b| b.base).collect()
    }

    /// Stream positions where both sides carry a real base, with the original
    /// reference and input base indices.
    pub fn matched(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.reference
            .iter()
            .zip(&self.input)
            .enumerate()
            .filter_map(|(k, (r, i))| Some((k, r.index?, i.index?)))
    }

    /// Stream position of every original base of one side.
    fn stream_positions(side: &[AlignedBase], num_bases: usize) -> Vec<usize> {
        let mut positions = vec![side.len(); num_bases];
        for (k, base) in side.iter().enumerate() {
            if let Some(idx) = base.index {
                positions[idx] = k;
            }
        }
        positions
    }
}

/// Merge the base calls of both traces along `path`. Bases whose columns lie
/// closer than `tolerance` pair up; otherwise the earlier base gets a pad.
pub fn insert_bases(
    reference: &Trace,
    input: &Trace,
    path: &AlignmentPath,
    tolerance: usize,
) -> CoRegisteredBases {
    let place = |trace: &Trace, columns: &[usize]| -> Vec<AlignedBase> {
        trace
            .base_chars()
            .into_iter()
            .zip(&trace.base_positions)
            .enumerate()
            .map(|(idx, (base, &pos))| AlignedBase {
                base,
                column: columns.get(pos).copied().unwrap_or(pos),
                index: Some(idx),
            })
            .collect()
    };
    let reference_bases = place(reference, &path.reference_columns());
    let input_bases = place(input, &path.input_columns());

    let mut merged = CoRegisteredBases::default();
    let (mut a, mut b) = (0, 0);
    while a < reference_bases.len() || b < input_bases.len() {
        match (reference_bases.get(a), input_bases.get(b)) {
            (Some(r), Some(i)) if r.column.abs_diff(i.column) < tolerance => {
                merged.reference.push(*r);
                merged.input.push(*i);
                a += 1;
                b += 1;
            }
            (Some(r), Some(i)) if r.column < i.column => {
                merged.reference.push(*r);
                merged.input.push(AlignedBase::pad(r.column));
                a += 1;
            }
            (Some(r), None) => {
                merged.reference.push(*r);
                merged.input.push(AlignedBase::pad(r.column));
                a += 1;
            }
            (_, Some(i)) => {
                merged.reference.push(AlignedBase::pad(i.column));
                merged.input.push(*i);
                b += 1;
            }
            (None, None) => break,
        }
    }
    merged
}

/// Linear fill of missing values; the ends copy the nearest known value.
fn fill_gaps(values: &[Option<i32>]) -> Vec<i32> {
    let mut out = vec![0; values.len()];
    let mut previous: Option<(usize, i32)> = None;
    let mut k = 0;
    while k < values.len() {
        if let Some(v) = values[k] {
            out[k] = v;
            previous = Some((k, v));
            k += 1;
            continue;
        }
        let next = (k..values.len()).find_map(|j| values[j].map(|v| (j, v)));
        let end = next.map_or(values.len(), |(j, _)| j);
        for (g, slot) in out.iter_mut().enumerate().take(end).skip(k) {
            *slot = match (previous, next) {
                (Some((pk, pv)), Some((nk, nv))) => {
                    let t = (g - pk) as f64 / (nk - pk) as f64;
                    (pv as f64 + t * (nv - pv) as f64).round() as i32
                }
                (Some((_, pv)), None) => pv,
                (None, Some((_, nv))) => nv,
                (None, None) => 0,
            };
        }
        k = end;
    }
    out
}

fn stream_clip(trace: &Trace, positions: &[usize], stream_len: usize) -> (usize, usize) {
    let left = if trace.clip_left == 0 {
        0
    } else {
        positions.get(trace.clip_left).copied().unwrap_or(stream_len)
    };
    let right = match trace.clip_right {
        0 => 0,
        r => match positions.get(r - 1) {
            Some(&k) => k + 1,
            None => stream_len + 1,
        },
    };
    (left, right)
}

/// Build both traces on the alignment's column axis, pads included.
pub fn interpolate(
    reference: &Trace,
    input: &Trace,
    path: &AlignmentPath,
    tolerance: usize,
) -> (Trace, Trace) {
    let bases = insert_bases(reference, input, path, tolerance);
    let build = |trace: &Trace, side: &[AlignedBase], pick: fn(&AlignedPair) -> Option<usize>| {
        let samples: [Vec<i32>; CHANNELS] = std::array::from_fn(|c| {
            let values: Vec<Option<i32>> = path
                .pairs()
                .iter()
                .map(|p| pick(p).and_then(|s| trace.samples[c].get(s).copied()))
                .collect();
            fill_gaps(&values)
        });
        let positions = CoRegisteredBases::stream_positions(side, trace.num_bases());
        let (clip_left, clip_right) = stream_clip(trace, &positions, side.len());
        Trace {
            name: trace.name.clone(),
            samples,
            bases: side.iter().map(|b| b.base).collect(),
            base_positions: side.iter().map(|b| b.column).collect(),
            clip_left,
            clip_right,
            strand: trace.strand,
        }
    };
    (
        build(reference, &bases.reference, |p| p.reference),
        build(input, &bases.input, |p| p.input),
    )
}

/// Piecewise-linear map between reference and input sample coordinates,
/// anchored at matched bases. Slope 1 outside the anchors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMap {
    anchors: Vec<(f64, f64)>,
}

impl SampleMap {
    pub fn from_anchors(anchors: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut kept: Vec<(f64, f64)> = vec![];
        for (r, i) in anchors {
            if kept.last().is_none_or(|&(lr, li)| r > lr && i > li) {
                kept.push((r, i));
            }
        }
        Self { anchors: kept }
    }

    pub fn from_bases(reference: &Trace, input: &Trace, bases: &CoRegisteredBases) -> Self {
        Self::from_anchors(bases.matched().map(|(_, r, i)| {
            (
                reference.base_positions[r] as f64,
                input.base_positions[i] as f64,
            )
        }))
    }

    #[inline(always)]
    pub fn anchors(&self) -> &[(f64, f64)] {
        &self.anchors
    }

    pub fn to_input(&self, reference_sample: f64) -> f64 {
        Self::map(&self.anchors, reference_sample, |a| a.0, |a| a.1)
    }

    pub fn to_reference(&self, input_sample: f64) -> f64 {
        Self::map(&self.anchors, input_sample, |a| a.1, |a| a.0)
    }

    fn map(
        anchors: &[(f64, f64)],
        x: f64,
        from: fn(&(f64, f64)) -> f64,
        to: fn(&(f64, f64)) -> f64,
    ) -> f64 {
        let (Some(first), Some(last)) = (anchors.first(), anchors.last()) else {
            return x;
        };
        if x <= from(first) {
            return to(first) + (x - from(first));
        }
        if x >= from(last) {
            return to(last) + (x - from(last));
        }
        let idx = anchors.partition_point(|a| from(a) <= x);
        let (lo, hi) = (&anchors[idx - 1], &anchors[idx]);
        let t = (x - from(lo)) / (from(hi) - from(lo));
        to(lo) + t * (to(hi) - to(lo))
    }
}

fn sample_at(row: &[i32], x: f64) -> f64 {
    if row.is_empty() || x < 0.0 || x > (row.len() - 1) as f64 {
        return 0.0;
    }
    let k = x.floor() as usize;
    let t = x - k as f64;
    match row.get(k + 1) {
        Some(&next) if t > 0.0 => row[k] as f64 * (1.0 - t) + next as f64 * t,
        _ => row[k] as f64,
    }
}

/// `input` redrawn on the reference's sample axis of length `len`.
pub fn resample(input: &Trace, map: &SampleMap, len: usize) -> Trace {
    let samples = std::array::from_fn(|c| {
        (0..len)
            .map(|k| sample_at(&input.samples[c], map.to_input(k as f64)).round() as i32)
            .collect()
    });
    let last = len.saturating_sub(1) as f64;
    Trace {
        name: input.name.clone(),
        samples,
        bases: input.bases.clone(),
        base_positions: input
            .base_positions
            .iter()
            .map(|&p| map.to_reference(p as f64).round().clamp(0.0, last) as usize)
            .collect(),
        clip_left: input.clip_left,
        clip_right: input.clip_right,
        strand: input.strand,
    }
}

/// Everything needed to compare an input against a reference sample by sample.
#[derive(Debug, Clone)]
pub struct CoRegistration {
    pub alignment: TraceAlignment,
    pub bases: CoRegisteredBases,
    pub map: SampleMap,
    /// The input on the reference's sample axis.
    pub resampled: Trace,
}

/// Pairing distance for base calls: half the reference's base spacing.
pub fn base_tolerance(reference: &Trace) -> usize {
    ((reference.mean_base_spacing() / 2.0).round() as usize).max(1)
}

pub fn co_register(
    reference: &Trace,
    input: &Trace,
    params: &AnalysisParameters,
    cache: &mut AlignmentCache,
) -> Result<CoRegistration, EngineError> {
    let alignment = TraceAligner::new(cache, params).align(reference, input)?;
    let bases = insert_bases(reference, input, &alignment.path, base_tolerance(reference));
    let map = SampleMap::from_bases(reference, input, &bases);
    let resampled = resample(input, &map, reference.len());
    debug!(
        "Co-registered '{}' onto '{}': {} stream bases, {} anchors",
        input.name,
        reference.name,
        bases.len(),
        map.anchors().len()
    );
    Ok(CoRegistration {
        alignment,
        bases,
        map,
        resampled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{base_sample, heights, TraceBuilder, BASES_50};

    fn inserted_input() -> Trace {
        let mut bases: Vec<char> = BASES_50.chars().collect();
        bases.insert(20, 'T');
        let mut h = heights(50, 7);
        h.insert(20, 500);
        TraceBuilder::new("in", &bases.iter().collect::<String>())
            .heights(h)
            .build()
    }

    #[test]
    fn test_identity_insert_bases() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let path = AlignmentPath::identity(trace.len());
        let bases = insert_bases(&trace, &trace, &path, 5);
        assert_eq!(bases.reference_string(), BASES_50);
        assert_eq!(bases.input_string(), BASES_50);
        assert_eq!(bases.matched().count(), 50);
    }

    #[test]
    fn test_interpolate_coregistered_is_identity() {
        let trace = TraceBuilder::new("r", BASES_50).build();
        let path = AlignmentPath::identity(trace.len());
        let (reference, input) = interpolate(&trace, &trace, &path, 5);
        assert_eq!(reference, trace);
        assert_eq!(input, trace);
    }

    #[test]
    fn test_insert_bases_pads_extra_base() {
        let reference = TraceBuilder::new("r", BASES_50).build();
        let input = inserted_input();
        let mut cache = AlignmentCache::new();
        let params = AnalysisParameters::default();
        let co = co_register(&reference, &input, &params, &mut cache).unwrap();
        assert_eq!(co.bases.len(), 51);
        assert_eq!(co.bases.reference[20].base, PAD_BASE);
        assert_eq!(co.bases.input[20].base, 'T');
        assert_eq!(co.bases.input[20].index, Some(20));
        assert_eq!(co.bases.matched().count(), 50);
        assert_eq!(co.map.to_input(base_sample(30) as f64), base_sample(31) as f64);
        assert_eq!(co.map.to_input(base_sample(5) as f64), base_sample(5) as f64);
        assert_eq!(co.resampled.len(), reference.len());
        assert_eq!(
            co.resampled.samples[0][base_sample(40)],
            input.samples[0][base_sample(41)]
        );

        let (aligned_ref, aligned_in) = interpolate(&reference, &input, &co.alignment.path, 5);
        assert_eq!(aligned_ref.len(), aligned_in.len());
        assert_eq!(aligned_ref.num_bases(), aligned_in.num_bases());
        assert_eq!(aligned_ref.base_at(20), Some(PAD_BASE));
        assert_eq!(aligned_ref.clip_right, 52);
    }

    #[test]
    fn test_fill_gaps() {
        let filled = fill_gaps(&[None, Some(10), None, None, Some(40), None]);
        assert_eq!(filled, vec![10, 10, 20, 30, 40, 40]);
        assert_eq!(fill_gaps(&[None, None]), vec![0, 0]);
    }

    #[test]
    fn test_sample_map_extrapolates_with_unit_slope() {
        let map = SampleMap::from_anchors([(10.0, 10.0), (20.0, 30.0), (15.0, 40.0)]);
        assert_eq!(map.anchors().len(), 2);
        assert_eq!(map.to_input(15.0), 20.0);
        assert_eq!(map.to_input(25.0), 35.0);
        assert_eq!(map.to_input(4.0), 4.0);
        assert_eq!(map.to_reference(20.0), 15.0);
        assert_eq!(SampleMap::default().to_input(7.5), 7.5);
    }
}
