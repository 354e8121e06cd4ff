//! Structural checks run before any analysis touches a trace.

use crate::engine::EngineError;
use tracescan_protocol::Trace;

/// Smallest number of bases a clip range may keep.
pub const MIN_CLIP_BASES: i64 = 10;

pub fn validate_trace(trace: &Trace, role: &str) -> Result<(), EngineError> {
    let name = &trace.name;
    if trace.is_empty() {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' has no samples"
        )));
    }
    let len = trace.len();
    if let Some(row) = trace.samples.iter().position(|row| row.len() != len) {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' channel {row} has {} samples, expected {len}",
            trace.samples[row].len()
        )));
    }
    if trace.samples.iter().flatten().any(|&v| v < 0) {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' contains negative amplitudes"
        )));
    }
    let base_count = trace.bases.chars().count();
    if base_count != trace.num_bases() {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' has {base_count} bases but {} base positions",
            trace.num_bases()
        )));
    }
    if base_count == 0 {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' has no base calls"
        )));
    }
    if let Some(&pos) = trace.base_positions.iter().find(|&&p| p >= len) {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' base position {pos} lies beyond {len} samples"
        )));
    }
    if trace.base_positions.windows(2).any(|w| w[1] < w[0]) {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' base positions are not in order"
        )));
    }
    if trace.clip_right > base_count + 1 {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' right clip {} beyond {base_count} bases",
            trace.clip_right
        )));
    }
    let span = trace.clip_span();
    if span < MIN_CLIP_BASES {
        return Err(EngineError::invalid_input(format!(
            "{role} trace '{name}' clip range {}..{} keeps {span} bases, at least {MIN_CLIP_BASES} needed",
            trace.clip_left, trace.clip_right
        )));
    }
    Ok(())
}

/// Both traces must share one sample axis when no alignment is done.
pub fn validate_same_coordinates(reference: &Trace, input: &Trace) -> Result<(), EngineError> {
    if reference.len() != input.len() {
        return Err(EngineError::invalid_input(format!(
            "Traces '{}' ({} samples) and '{}' ({} samples) differ in length; align them first",
            reference.name,
            reference.len(),
            input.name,
            input.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorCode;
    use crate::test_support::TraceBuilder;

    #[test]
    fn test_clip_range_minimum() {
        let mut trace = TraceBuilder::new("ref", "ACGTACGTACGTACGTACGT").build();
        trace.clip_left = 0;
        trace.clip_right = 10;
        let err = validate_trace(&trace, "Reference").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("at least 10"));
        trace.clip_right = 11;
        validate_trace(&trace, "Reference").unwrap();
    }

    #[test]
    fn test_rejects_malformed_traces() {
        let good = TraceBuilder::new("t", "ACGTACGTACGTACGT").build();
        validate_trace(&good, "Input").unwrap();

        let mut short_row = good.clone();
        short_row.samples[2].pop();
        assert!(validate_trace(&short_row, "Input").is_err());

        let mut negative = good.clone();
        negative.samples[1][3] = -1;
        assert!(validate_trace(&negative, "Input").is_err());

        let mut unordered = good.clone();
        unordered.base_positions.swap(2, 3);
        assert!(validate_trace(&unordered, "Input").is_err());

        let mut miscounted = good.clone();
        miscounted.bases.push('A');
        assert!(validate_trace(&miscounted, "Input").is_err());

        let empty = Trace::default();
        let err = validate_trace(&empty, "Input").unwrap_err();
        assert!(err.message.contains("no samples"));
    }

    #[test]
    fn test_same_coordinates() {
        let a = TraceBuilder::new("a", "ACGTACGTACGTACGT").build();
        let b = TraceBuilder::new("b", "ACGTACGTACGTACGTA").build();
        validate_same_coordinates(&a, &a).unwrap();
        assert!(validate_same_coordinates(&a, &b).is_err());
    }
}
