//! Alignment-based difference scan: co-register the input onto the reference,
//! then tag bases where the scaled difference of the two traces shows a lost
//! reference peak and a gained peak on another channel.

use crate::caller::Caller;
use crate::engine::{EngineError, ResultCode, ScanOutcome};
use crate::interpolate::{co_register, CoRegisteredBases};
use crate::iupac_code::IupacCode;
use crate::mutscan::{classify, tag_calls, tag_extents};
use crate::parameter::AnalysisParameters;
use crate::preprocess::{clip_region, PreprocessedTrace};
use crate::scale::ChannelScale;
use crate::trace_align::AlignmentCache;
use crate::validate::validate_trace;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tracescan_protocol::{
    base_channel, BaseCall, MutationTag, Strand, TagType, Trace, CHANNELS, PAD_BASE,
    REFERENCE_BASE,
};

/// `reference − input / scale` per channel and sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferenceTrace {
    rows: [Vec<f64>; CHANNELS],
}

impl DifferenceTrace {
    pub fn new(reference: &Trace, input: &Trace, scale: &ChannelScale) -> Self {
        Self {
            rows: std::array::from_fn(|c| {
                let factor = scale.factor(c);
                reference.samples[c]
                    .iter()
                    .zip(&input.samples[c])
                    .map(|(&r, &i)| r as f64 - i as f64 / factor)
                    .collect()
            }),
        }
    }

    #[inline(always)]
    pub fn row(&self, channel: usize) -> &[f64] {
        &self.rows[channel]
    }

    /// `(min, max)` of one channel over `column ± window`; `(0, 0)` outside
    /// the trace.
    pub fn window_extremes(&self, channel: usize, column: usize, window: usize) -> (f64, f64) {
        let row = &self.rows[channel];
        if row.is_empty() {
            return (0.0, 0.0);
        }
        let lo = column.saturating_sub(window).min(row.len() - 1);
        let hi = (column + window).min(row.len() - 1);
        row[lo..=hi]
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &v| {
                (min.min(v), max.max(v))
            })
    }
}

/// Stretch of disagreeing stream positions, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MismatchRun {
    pub start: usize,
    pub end: usize,
    /// The run contains a pad on either side.
    pub indel: bool,
}

impl MismatchRun {
    pub fn positions(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

fn bases_agree(reference: char, input: char) -> bool {
    if reference == PAD_BASE || input == PAD_BASE {
        return false;
    }
    let (r, i) = (reference.to_ascii_uppercase(), input.to_ascii_uppercase());
    r == 'N' || i == 'N' || r == i
}

/// Walk both base streams and collect runs of disagreement. A run closes
/// once `sync_window` consecutive positions agree again, or after
/// `max_lookahead` positions.
pub fn scan_base_mismatches(
    bases: &CoRegisteredBases,
    sync_window: usize,
    max_lookahead: usize,
) -> Vec<MismatchRun> {
    let agree = |k: usize| bases_agree(bases.reference[k].base, bases.input[k].base);
    let len = bases.len();
    let mut runs = vec![];
    let mut k = 0;
    while k < len {
        if agree(k) {
            k += 1;
            continue;
        }
        let start = k;
        let mut end = k;
        let mut in_sync = 0;
        let mut j = k + 1;
        while j < len && j - start < max_lookahead {
            if agree(j) {
                in_sync += 1;
                if in_sync >= sync_window {
                    break;
                }
            } else {
                in_sync = 0;
                end = j;
            }
            j += 1;
        }
        let indel = (start..=end)
            .any(|p| bases.reference[p].is_pad() || bases.input[p].is_pad());
        runs.push(MismatchRun { start, end, indel });
        k = end + 1;
    }
    runs
}

fn soft_failure(message: String, mut warnings: Vec<String>) -> ScanOutcome {
    warn!("{message}");
    warnings.push(message);
    ScanOutcome {
        code: ResultCode::AlignmentFailure,
        tags: vec![],
        warnings,
    }
}

/// Co-register `input` onto `reference` and tag the differences.
pub fn analyse(
    reference: &Trace,
    input: &Trace,
    params: &AnalysisParameters,
    cache: &mut AlignmentCache,
) -> Result<ScanOutcome, EngineError> {
    validate_trace(reference, "Reference")?;
    validate_trace(input, "Input")?;
    params.validate_tracediff()?;

    let co = co_register(reference, input, params, cache)?;
    let resampled = &co.resampled;
    let (left, right) = clip_region(reference);
    let pre_ref = PreprocessedTrace::from_trace(reference, left, right, params)?;
    let pre_in = PreprocessedTrace::from_trace(resampled, left, right, params)?;
    let window = pre_ref.search_window();

    let Some(scale) = ChannelScale::from_matches(
        &pre_ref.match_peaks(&pre_in),
        params.scale_outlier_sd.value(),
    ) else {
        return Ok(soft_failure(
            format!(
                "No peaks of '{}' could be matched with '{}'; pair skipped",
                input.name, reference.name
            ),
            co.alignment.warnings(),
        ));
    };
    let difference = DifferenceTrace::new(reference, resampled, &scale);

    let sync_window = params.sync_window.value().max(1) as usize;
    let runs = scan_base_mismatches(
        &co.bases,
        sync_window,
        params.max_lookahead.value().max(2) as usize,
    );
    let suppressed: Vec<RangeInclusive<usize>> = runs
        .iter()
        .filter(|r| r.indel)
        .map(|r| r.start.saturating_sub(sync_window)..=r.end + sync_window)
        .collect();
    debug!(
        "TraceDiff '{}' vs '{}': {} mismatch run(s), {} indel(s)",
        reference.name,
        input.name,
        runs.len(),
        suppressed.len()
    );

    let kept = reference.kept_bases();
    let sensitivity = params.diff_sensitivity.value();
    let ambiguity = params.ambiguity_enabled();
    let input_caller = Caller::AmbiguityWindow {
        window: params.ambiguity_window.value().max(0) as usize,
    };
    let in_peaks = pre_in.peaks();
    let ref_peaks = pre_ref.peaks();

    let usable = |stream: usize, reference_index: usize| -> Option<usize> {
        if !kept.contains(&reference_index) || suppressed.iter().any(|r| r.contains(&stream)) {
            return None;
        }
        let sample = reference.base_positions[reference_index];
        (!co.alignment.is_skipped(sample)).then_some(sample)
    };
    let position_of = |reference_index: usize, input_index: usize| {
        [
            input_index,
            input.base_positions[input_index],
            reference_index,
            reference.base_positions[reference_index],
        ]
    };

    // Keyed by reference base, so each base carries at most one tag.
    let mut tags: BTreeMap<usize, MutationTag> = BTreeMap::new();
    for (stream, reference_index, input_index) in co.bases.matched() {
        let Some(sample) = usable(stream, reference_index) else {
            continue;
        };
        let Some(p) = reference
            .base_at(reference_index)
            .and_then(base_channel)
        else {
            continue;
        };
        let reference_amplitude = ref_peaks
            .nearest_peak(p, sample, window)
            .map_or(reference.samples[p][sample], |col| ref_peaks.value(p, col));
        if reference_amplitude <= 0 {
            continue;
        }
        let (_, loss) = difference.window_extremes(p, sample, window);
        let gained = (0..CHANNELS)
            .filter(|&g| g != p)
            .map(|g| (g, -difference.window_extremes(g, sample, window).0))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let Some((g, gain)) = gained else {
            continue;
        };
        let threshold = sensitivity * reference_amplitude as f64;
        if loss < threshold || gain < threshold {
            continue;
        }
        let peak_drop = (loss / reference_amplitude as f64).clamp(0.0, 1.0);
        let Some(tag_type) = classify(peak_drop, params) else {
            continue;
        };

        let call = input_caller.call(in_peaks.channel_rows(), sample);
        let amplitude_of = |c: usize| {
            call.ranked
                .iter()
                .find(|r| r.channel == c)
                .map_or(resampled.samples[c][sample], |r| r.amplitude)
        };
        let lost = (p, amplitude_of(p));
        let new = (g, amplitude_of(g));
        let (primary, secondary) = match tag_type {
            TagType::Muta => (new, lost),
            TagType::Hete if new.1 > lost.1 => (new, lost),
            TagType::Hete => (lost, new),
        };
        let reference_call = BaseCall {
            base: tracescan_protocol::CHANNEL_BASES[p],
            amplitude: reference_amplitude,
        };
        let snr = Caller::Snr
            .call(&resampled.samples, sample)
            .snr
            .map_or(0.0, |s| s.db);
        tags.insert(
            reference_index,
            MutationTag::new(
                tag_type,
                input.strand,
                position_of(reference_index, input_index),
                tag_calls(tag_type, reference_call, primary, secondary, ambiguity),
                snr,
                Some(peak_drop),
            ),
        );
    }

    // Substitutions seen in the base calls but not in the traces.
    for run in runs.iter().filter(|r| !r.indel) {
        let Some((stream, reference_index, input_index)) = run
            .positions()
            .find_map(|k| {
                let r = co.bases.reference[k].index?;
                let i = co.bases.input[k].index?;
                Some((k, r, i))
            })
        else {
            continue;
        };
        if tags.contains_key(&reference_index) {
            continue;
        }
        let Some(sample) = usable(stream, reference_index) else {
            continue;
        };
        let reference_base = co.bases.reference[stream].base.to_ascii_uppercase();
        let input_base = co.bases.input[stream].base.to_ascii_uppercase();
        let amplitude = |trace: &Trace, base: char| {
            base_channel(base).map_or(0, |c| trace.samples[c][sample])
        };
        let code = IupacCode::from_letter(input_base);
        let tag_type = if code.channels().len() == 2
            && !code.subset(IupacCode::from_letter(reference_base)).is_empty()
        {
            TagType::Hete
        } else {
            TagType::Muta
        };
        let calls = vec![
            BaseCall {
                base: reference_base,
                amplitude: amplitude(reference, reference_base),
            },
            BaseCall {
                base: input_base,
                amplitude: amplitude(resampled, input_base),
            },
        ];
        let snr = Caller::Snr
            .call(&resampled.samples, sample)
            .snr
            .map_or(0.0, |s| s.db);
        tags.insert(
            reference_index,
            MutationTag::new(
                tag_type,
                input.strand,
                position_of(reference_index, input_index),
                calls,
                snr,
                None,
            ),
        );
    }

    let complement = params.complement_enabled() && input.strand == Strand::Reverse;
    let extents = tag_extents(reference, input);
    let mut tags: Vec<MutationTag> = tags
        .into_values()
        .map(|tag| {
            if complement {
                tag.complemented(extents)
            } else {
                tag
            }
        })
        .collect();
    tags.sort_by_key(|tag| tag.position(REFERENCE_BASE));

    let code = if co.alignment.failed() {
        ResultCode::AlignmentFailure
    } else {
        ResultCode::Success
    };
    info!(
        "TraceDiff '{}' vs '{}': {} tag(s), {:?}",
        reference.name,
        input.name,
        tags.len(),
        code
    );
    Ok(ScanOutcome {
        code,
        tags,
        warnings: co.alignment.warnings(),
    })
}
