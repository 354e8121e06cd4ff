//! Cross-strand mutation scan over two traces on one sample axis.
//!
//! The input is compared peak by peak against the reference. A peak the input
//! has but the reference lacks, together with a drop of the reference base's
//! peak, marks a heterozygote (`HETE`) or a clean substitution (`MUTA`).

use crate::caller::Caller;
use crate::engine::{EngineError, ResultCode, ScanOutcome};
use crate::interpolate::SampleMap;
use crate::iupac_code::ambiguity_letter;
use crate::parameter::AnalysisParameters;
use crate::preprocess::{clip_region, PreprocessedTrace};
use crate::scale::ChannelScale;
use crate::tracediff::DifferenceTrace;
use crate::validate::{validate_same_coordinates, validate_trace};
use log::{info, warn};
use std::collections::BTreeMap;
use tracescan_protocol::{
    BaseCall, MutationTag, TagType, Trace, CHANNELS, CHANNEL_BASES, REFERENCE_BASE, TAG_POSITIONS,
};

/// Peak-drop classification shared by both scanners.
pub fn classify(peak_drop: f64, params: &AnalysisParameters) -> Option<TagType> {
    if peak_drop <= params.lower_peak_drop.value() {
        None
    } else if peak_drop < params.upper_peak_drop.value() {
        Some(TagType::Hete)
    } else {
        Some(TagType::Muta)
    }
}

/// `[input bases, input samples, reference bases, reference samples]`, the
/// extents tag positions are mirrored in.
pub fn tag_extents(reference: &Trace, input: &Trace) -> [usize; TAG_POSITIONS] {
    [input.num_bases(), input.len(), reference.num_bases(), reference.len()]
}

/// Base calls of a tag: reference first, then the input's primary and, for a
/// heterozygote, its secondary channel.
pub fn tag_calls(
    tag_type: TagType,
    reference: BaseCall,
    primary: (usize, i32),
    secondary: (usize, i32),
    ambiguity: bool,
) -> Vec<BaseCall> {
    let call = |(channel, amplitude): (usize, i32)| BaseCall {
        base: CHANNEL_BASES[channel],
        amplitude,
    };
    match tag_type {
        TagType::Muta => vec![reference, call(primary)],
        TagType::Hete if ambiguity => vec![
            reference,
            BaseCall {
                base: ambiguity_letter(primary.0, secondary.0),
                amplitude: primary.1,
            },
            call(secondary),
        ],
        TagType::Hete => vec![reference, call(primary)],
    }
}

struct Candidate {
    input_column: usize,
    reference_column: usize,
    new_channel: usize,
    reference_channel: usize,
    normalized: f64,
    peak_drop: f64,
}

/// Scan `input` against `reference`. Both must share sample coordinates; when
/// the input was resampled onto the reference, `input_map` holds the sample map
/// and the original input, used to report input positions.
pub fn analyse(
    reference: &Trace,
    input: &Trace,
    params: &AnalysisParameters,
    input_map: Option<(&SampleMap, &Trace)>,
) -> Result<ScanOutcome, EngineError> {
    validate_trace(reference, "Reference")?;
    validate_trace(input, "Input")?;
    validate_same_coordinates(reference, input)?;
    params.validate_mutscan()?;

    let (left, right) = clip_region(reference);
    let pre_ref = PreprocessedTrace::from_trace(reference, left, right, params)?;
    let pre_in = PreprocessedTrace::from_trace(input, left, right, params)?;
    let window = pre_ref.search_window();

    let matches = pre_ref.match_peaks(&pre_in);
    let Some(scale) = ChannelScale::from_matches(&matches, params.scale_outlier_sd.value()) else {
        let message = format!(
            "No peaks of '{}' could be matched with '{}'; pair skipped",
            input.name, reference.name
        );
        warn!("{message}");
        return Ok(ScanOutcome {
            code: ResultCode::AlignmentFailure,
            tags: vec![],
            warnings: vec![message],
        });
    };
    let difference = DifferenceTrace::new(reference, input, &scale);

    // One candidate per reference column, strongest normalized new peak wins.
    let mut candidates: BTreeMap<usize, Candidate> = BTreeMap::new();
    let in_peaks = pre_in.peaks();
    let ref_peaks = pre_ref.peaks();
    for new_channel in 0..CHANNELS {
        for column in in_peaks.peak_columns(new_channel) {
            let amplitude = in_peaks.value(new_channel, column);
            // In reference units, against the reference's floor.
            let normalized = amplitude as f64 / scale.factor(new_channel);
            if normalized <= pre_ref.noise_floor()[column] {
                continue;
            }
            if ref_peaks.nearest_peak(new_channel, column, window).is_some() {
                continue;
            }
            let strongest = (0..CHANNELS)
                .filter(|&c| c != new_channel)
                .filter_map(|c| {
                    let col = ref_peaks.nearest_peak(c, column, window)?;
                    Some((c, col, ref_peaks.value(c, col)))
                })
                .max_by_key(|&(c, _, amp)| (amp, std::cmp::Reverse(c)));
            let Some((reference_channel, reference_column, reference_amplitude)) = strongest
            else {
                continue;
            };
            let input_p = in_peaks
                .nearest_peak(reference_channel, reference_column, window)
                .map_or(0, |col| in_peaks.value(reference_channel, col));
            let scaled = input_p as f64 / scale.factor(reference_channel);
            let peak_drop = (1.0 - scaled / reference_amplitude as f64).clamp(0.0, 1.0);
            let candidate = Candidate {
                input_column: column,
                reference_column,
                new_channel,
                reference_channel,
                normalized,
                peak_drop,
            };
            match candidates.get(&reference_column) {
                Some(existing) if existing.normalized >= normalized => {}
                _ => {
                    candidates.insert(reference_column, candidate);
                }
            }
        }
    }

    let ambiguity_caller = Caller::AmbiguityWindow {
        window: params.ambiguity_window.value().max(0) as usize,
    };
    let complement = params.complement_enabled()
        && input_map.map_or(input, |(_, original)| original).strand
            == tracescan_protocol::Strand::Reverse;
    let sensitivity = params.diff_sensitivity.value();
    let mut tags = vec![];
    for candidate in candidates.values() {
        let Some(tag_type) = classify(candidate.peak_drop, params) else {
            continue;
        };
        let column = candidate.input_column;
        let input_call = ambiguity_caller.call(in_peaks.channel_rows(), column);
        if !input_call.valid {
            continue;
        }
        let reference_amplitude =
            ref_peaks.value(candidate.reference_channel, candidate.reference_column);
        let (low, _) = difference.window_extremes(candidate.new_channel, column, window);
        if low > -sensitivity * reference_amplitude as f64 {
            continue;
        }

        let reference_call = Caller::Level.call(ref_peaks.channel_rows(), candidate.reference_column);
        let reference_base = BaseCall {
            base: CHANNEL_BASES[reference_call.top().channel],
            amplitude: reference_call.top().amplitude,
        };
        let amplitude_of = |c: usize| {
            input_call
                .ranked
                .iter()
                .find(|r| r.channel == c)
                .map_or(0, |r| r.amplitude)
        };
        let new = (candidate.new_channel, amplitude_of(candidate.new_channel));
        let old = (
            candidate.reference_channel,
            amplitude_of(candidate.reference_channel),
        );
        // Ties go to the reference channel.
        let (primary, secondary) = if new.1 > old.1 { (new, old) } else { (old, new) };
        let primary = if tag_type == TagType::Muta { new } else { primary };
        let calls = tag_calls(
            tag_type,
            reference_base,
            primary,
            secondary,
            params.ambiguity_enabled(),
        );
        let snr = Caller::Snr
            .call(&input.samples, column)
            .snr
            .map_or(0.0, |s| s.db);

        let (input_sample, input_trace) = match input_map {
            Some((map, original)) => {
                let mapped = map.to_input(column as f64).round().max(0.0) as usize;
                (mapped.min(original.len().saturating_sub(1)), original)
            }
            None => (column, input),
        };
        let input_base = input_trace.nearest_base(input_sample).unwrap_or(0);
        let reference_index = reference
            .nearest_base(candidate.reference_column)
            .unwrap_or(0);
        let tag = MutationTag::new(
            tag_type,
            input_trace.strand,
            [input_base, input_sample, reference_index, candidate.reference_column],
            calls,
            snr,
            Some(candidate.peak_drop),
        );
        tags.push(if complement {
            tag.complemented(tag_extents(reference, input_trace))
        } else {
            tag
        });
    }

    // Complementing reverses the order.
    tags.sort_by_key(|tag| tag.position(REFERENCE_BASE));
    info!(
        "MutScan '{}' vs '{}': {} tag(s)",
        reference.name,
        input.name,
        tags.len()
    );
    Ok(ScanOutcome {
        code: ResultCode::Success,
        tags,
        warnings: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorCode;
    use crate::test_support::{base_sample, heights, TraceBuilder, BASES_50};
    use tracescan_protocol::{base_channel, Strand, INPUT_SAMPLE};

    fn mutated_input() -> Trace {
        mutated_input_on(Strand::Forward)
    }

    /// Heterozygote at 25, substitution at 40.
    fn mutated_input_on(strand: Strand) -> Trace {
        let h = heights(50, 7);
        let mut bases: Vec<char> = BASES_50.chars().collect();
        bases[40] = crate::test_support::substitute(bases[40]);
        let het_ref = base_channel(bases[25]).unwrap();
        let het_alt = base_channel(crate::test_support::substitute(bases[25])).unwrap();
        let mut mix = [0; CHANNELS];
        mix[het_ref] = h[25] / 2;
        mix[het_alt] = h[25] / 2;
        TraceBuilder::new("in", &bases.iter().collect::<String>())
            .mix(25, mix)
            .strand(strand)
            .build()
    }

    #[test]
    fn test_finds_heterozygote_and_substitution() {
        let reference = TraceBuilder::new("ref", BASES_50).build();
        let input = mutated_input();
        let params = AnalysisParameters::default();
        let outcome = analyse(&reference, &input, &params, None).unwrap();
        assert_eq!(outcome.code, ResultCode::Success);
        assert_eq!(outcome.tags.len(), 2);

        let het = &outcome.tags[0];
        assert_eq!(het.tag_type(), TagType::Hete);
        assert_eq!(het.position(REFERENCE_BASE), 25);
        assert_eq!(het.position(INPUT_SAMPLE), base_sample(25));
        let ref_base = BASES_50.chars().nth(25).unwrap();
        let alt_base = crate::test_support::substitute(ref_base);
        assert_eq!(het.calls()[0].base, ref_base);
        let expected = ambiguity_letter(
            base_channel(ref_base).unwrap(),
            base_channel(alt_base).unwrap(),
        );
        assert_eq!(het.calls()[1].base, expected);
        assert_eq!(het.calls()[2].base, alt_base);
        assert!((het.peak_drop().unwrap() - 0.5).abs() < 0.05);
        assert!(het.comment().contains("PKD="));

        let muta = &outcome.tags[1];
        assert_eq!(muta.tag_type(), TagType::Muta);
        assert_eq!(muta.position(REFERENCE_BASE), 40);
        assert_eq!(muta.calls().len(), 2);
        assert_eq!(
            muta.calls()[1].base,
            crate::test_support::substitute(BASES_50.chars().nth(40).unwrap())
        );
        assert!(muta.snr() > 40.0);
        assert!(!muta.comment().contains("PKD"));
    }

    #[test]
    fn test_identical_traces_give_no_tags() {
        let reference = TraceBuilder::new("ref", BASES_50).build();
        let params = AnalysisParameters::default();
        let outcome = analyse(&reference, &reference, &params, None).unwrap();
        assert!(outcome.tags.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_new_peak_below_floor_after_scaling_is_ignored() {
        // Base 25 is G between a strong C and a T; the input's A channel runs
        // at twice the reference's level.
        let mut h = heights(50, 7);
        h[24] = 999;
        h[25] = 400;
        let reference = TraceBuilder::new("ref", BASES_50).heights(h.clone()).build();
        let mut input = TraceBuilder::new("in", BASES_50)
            .heights(h)
            .mix(25, [125, 0, 200, 0])
            .build();
        for v in input.samples[0].iter_mut() {
            *v *= 2;
        }
        let params = AnalysisParameters::default();
        let pre_in = PreprocessedTrace::from_clip(&input, &params).unwrap();
        // The input's own floor would let the A peak through.
        assert_eq!(pre_in.peaks().value(0, base_sample(25)), 250);

        let outcome = analyse(&reference, &input, &params, None).unwrap();
        assert_eq!(outcome.code, ResultCode::Success);
        assert!(outcome.tags.is_empty(), "{:?}", outcome.tags);
    }

    #[test]
    fn test_ambiguity_off_reports_dominant_base() {
        let reference = TraceBuilder::new("ref", BASES_50).build();
        let input = mutated_input();
        let mut params = AnalysisParameters::default();
        params
            .set_by_name("ambiguity_calls", &serde_json::json!(0))
            .unwrap();
        let outcome = analyse(&reference, &input, &params, None).unwrap();
        let het = &outcome.tags[0];
        assert_eq!(het.calls().len(), 2);
        assert_eq!(het.calls()[1].base, BASES_50.chars().nth(25).unwrap());
    }

    #[test]
    fn test_reverse_strand_tags_are_complemented() {
        let reference = TraceBuilder::new("ref", BASES_50).build();
        let input = mutated_input_on(Strand::Reverse);
        let mut params = AnalysisParameters::default();
        params
            .set_by_name("complement_tags", &serde_json::json!(1))
            .unwrap();
        let outcome = analyse(&reference, &input, &params, None).unwrap();
        let reported: Vec<usize> = outcome
            .tags
            .iter()
            .map(|t| t.position(REFERENCE_BASE))
            .collect();
        assert_eq!(reported, vec![50 - 1 - 40, 50 - 1 - 25]);
        let muta = &outcome.tags[0];
        assert_eq!(muta.tag_type(), TagType::Muta);
        assert_eq!(
            muta.calls()[0].base,
            tracescan_protocol::complement_base(BASES_50.chars().nth(40).unwrap())
        );
        assert_eq!(muta.strand(), Strand::Reverse);
    }

    #[test]
    fn test_invalid_inputs_produce_no_output() {
        let reference = TraceBuilder::new("ref", BASES_50).build();
        let short = TraceBuilder::new("short", &BASES_50[..40]).build();
        let params = AnalysisParameters::default();
        let err = analyse(&reference, &short, &params, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let mut bad = AnalysisParameters::default();
        bad.set_by_name("noise_threshold", &serde_json::json!(2.0))
            .unwrap();
        let err = analyse(&reference, &reference, &bad, None).unwrap_err();
        assert!(err.message.contains("noise_threshold"));
    }

    #[test]
    fn test_classify_bounds() {
        let params = AnalysisParameters::default();
        assert_eq!(classify(0.2, &params), None);
        assert_eq!(classify(0.21, &params), Some(TagType::Hete));
        assert_eq!(classify(0.79, &params), Some(TagType::Hete));
        assert_eq!(classify(0.8, &params), Some(TagType::Muta));
    }
}
