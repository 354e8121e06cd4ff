use crate::{
    interpolate::{base_tolerance, co_register, interpolate},
    mutscan,
    parameter::{AnalysisParameters, ParameterInfo},
    preprocess::PreprocessedTrace,
    trace_align::{AlignmentCache, TraceAligner},
    tracediff,
    validate::validate_trace,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, error::Error, fmt, path::Path};
use tracescan_protocol::{MutationTag, Trace};

pub type TraceId = String;
pub type OpId = String;
pub type RunId = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    pub traces: HashMap<TraceId, Trace>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub parameters: AnalysisParameters,
}

impl ProjectState {
    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read state file '{path}': {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse state JSON '{path}': {e}"),
        })
    }

    pub fn save_to_path(&self, path: &str) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| EngineError {
            code: ErrorCode::Internal,
            message: format!("Could not serialize state: {e}"),
        })?;
        std::fs::write(path, text).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not write state file '{path}': {e}"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Read a trace from a JSON file.
    LoadTrace {
        path: String,
        as_id: Option<TraceId>,
    },
    RemoveTrace {
        trace_id: TraceId,
    },
    /// Peak statistics of one trace inside its clip points.
    Preprocess {
        trace_id: TraceId,
    },
    /// Cross-strand scan; with `align` the input is first co-registered onto
    /// the reference.
    MutScan {
        reference: TraceId,
        input: TraceId,
        #[serde(default)]
        align: bool,
    },
    TraceDiff {
        reference: TraceId,
        input: TraceId,
    },
    /// Store both traces on the alignment's column axis, pads included.
    TraceAlign {
        reference: TraceId,
        input: TraceId,
        output_prefix: Option<String>,
    },
    SetParameter {
        name: String,
        value: serde_json::Value,
    },
    ResetParameters,
    FlushCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub run_id: RunId,
    pub ops: Vec<Operation>,
}

/// Outcome of an operation that ran to completion. `AlignmentFailure` means
/// part of the input was skipped; the reasons are in the warnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    Success,
    AlignmentFailure,
}

/// What a scan hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub code: ResultCode,
    pub tags: Vec<MutationTag>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub op_id: OpId,
    #[serde(default)]
    pub result_code: ResultCode,
    pub created_trace_ids: Vec<TraceId>,
    #[serde(default)]
    pub tags: Vec<MutationTag>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub run_id: RunId,
    pub op: Operation,
    pub result: OpResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    Unsupported,
    Io,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for EngineError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub supported_operations: Vec<String>,
    pub parameters: Vec<ParameterInfo>,
    pub deterministic_operation_log: bool,
}

pub trait Engine {
    fn apply(&mut self, op: Operation) -> Result<OpResult, EngineError>;
    fn apply_workflow(&mut self, wf: Workflow) -> Result<Vec<OpResult>, EngineError>;
    fn snapshot(&self) -> &ProjectState;
}

#[derive(Debug, Clone, Default)]
pub struct TraceEngine {
    state: ProjectState,
    journal: Vec<OperationRecord>,
    op_counter: u64,
    cache: AlignmentCache,
}

fn lookup<'a>(traces: &'a HashMap<TraceId, Trace>, id: &str) -> Result<&'a Trace, EngineError> {
    traces
        .get(id)
        .ok_or_else(|| EngineError::not_found(format!("Trace '{id}' not found")))
}

impl TraceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ProjectState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProjectState {
        &mut self.state
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            protocol_version: "v1".to_string(),
            supported_operations: vec![
                "LoadTrace".to_string(),
                "RemoveTrace".to_string(),
                "Preprocess".to_string(),
                "MutScan".to_string(),
                "TraceDiff".to_string(),
                "TraceAlign".to_string(),
                "SetParameter".to_string(),
                "ResetParameters".to_string(),
                "FlushCache".to_string(),
            ],
            parameters: AnalysisParameters::default().describe(),
            deterministic_operation_log: true,
        }
    }

    pub fn operation_log(&self) -> &[OperationRecord] {
        &self.journal
    }

    pub fn cache(&self) -> &AlignmentCache {
        &self.cache
    }

    fn next_op_id(&mut self) -> OpId {
        self.op_counter += 1;
        format!("op-{}", self.op_counter)
    }

    fn derive_trace_id(path: &str) -> TraceId {
        Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "trace".to_string())
    }

    fn unique_trace_id(&self, base: &str) -> TraceId {
        if !self.state.traces.contains_key(base) {
            return base.to_string();
        }
        let mut i = 2usize;
        loop {
            let candidate = format!("{base}_{i}");
            if !self.state.traces.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    fn load_trace(path: &str) -> Result<Trace, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read trace file '{path}': {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse trace JSON '{path}': {e}"),
        })
    }

    fn store_trace(&mut self, base: &str, mut trace: Trace) -> TraceId {
        let trace_id = self.unique_trace_id(base);
        if trace.name.is_empty() {
            trace.name = trace_id.clone();
        }
        self.state.traces.insert(trace_id.clone(), trace);
        trace_id
    }

    fn absorb(result: &mut OpResult, outcome: ScanOutcome) {
        result.result_code = outcome.code;
        result.tags = outcome.tags;
        result.warnings.extend(outcome.warnings);
        result.messages.extend(result.tags.iter().map(|t| {
            format!(
                "{} at reference base {}: {}",
                t.code(),
                t.position(tracescan_protocol::REFERENCE_BASE),
                t.comment()
            )
        }));
    }

    fn apply_internal(&mut self, op: Operation, run_id: &str) -> Result<OpResult, EngineError> {
        let op_id = self.next_op_id();
        let mut result = OpResult {
            op_id,
            result_code: ResultCode::Success,
            created_trace_ids: vec![],
            tags: vec![],
            warnings: vec![],
            messages: vec![],
        };

        match op {
            Operation::LoadTrace { path, as_id } => {
                let trace = Self::load_trace(&path)?;
                let base = as_id.unwrap_or_else(|| Self::derive_trace_id(&path));
                let trace_id = self.store_trace(&base, trace);
                result.created_trace_ids.push(trace_id.clone());
                result
                    .messages
                    .push(format!("Loaded '{path}' as '{trace_id}'"));
            }
            Operation::RemoveTrace { trace_id } => {
                if self.state.traces.remove(&trace_id).is_none() {
                    return Err(EngineError::not_found(format!(
                        "Trace '{trace_id}' not found"
                    )));
                }
                result.messages.push(format!("Removed trace '{trace_id}'"));
            }
            Operation::Preprocess { trace_id } => {
                let trace = lookup(&self.state.traces, &trace_id)?;
                validate_trace(trace, "Trace")?;
                self.state.parameters.validate_preprocess()?;
                let pre = PreprocessedTrace::from_clip(trace, &self.state.parameters)?;
                let (left, right) = pre.region();
                let intervals = pre.intervals();
                result.messages.push(format!(
                    "Trace '{trace_id}': peaks A={} C={} G={} T={} in samples {left}..={right}",
                    pre.peak_count()[0],
                    pre.peak_count()[1],
                    pre.peak_count()[2],
                    pre.peak_count()[3],
                ));
                result.messages.push(format!(
                    "Peak spacing min {} max {} mode {} mean {:.2} sd {:.2}, search window {}",
                    intervals.min,
                    intervals.max,
                    intervals.mode,
                    intervals.mean,
                    intervals.stddev,
                    pre.search_window()
                ));
            }
            Operation::MutScan {
                reference,
                input,
                align,
            } => {
                let params = &self.state.parameters;
                let reference_trace = lookup(&self.state.traces, &reference)?;
                let input_trace = lookup(&self.state.traces, &input)?;
                let outcome = if align {
                    validate_trace(reference_trace, "Reference")?;
                    validate_trace(input_trace, "Input")?;
                    params.validate_alignment()?;
                    let co = co_register(reference_trace, input_trace, params, &mut self.cache)?;
                    let mut outcome = mutscan::analyse(
                        reference_trace,
                        &co.resampled,
                        params,
                        Some((&co.map, input_trace)),
                    )?;
                    let skipped = co.alignment.skipped_reference_ranges();
                    outcome.tags.retain(|t| {
                        let sample = t.position(tracescan_protocol::REFERENCE_SAMPLE);
                        !skipped.iter().any(|r| r.contains(&sample))
                    });
                    if co.alignment.failed() {
                        outcome.code = ResultCode::AlignmentFailure;
                    }
                    outcome.warnings.extend(co.alignment.warnings());
                    outcome
                } else {
                    mutscan::analyse(reference_trace, input_trace, params, None)?
                };
                info!(
                    "MutScan '{reference}' vs '{input}' (align {align}): {:?}",
                    outcome.code
                );
                Self::absorb(&mut result, outcome);
                result.messages.insert(
                    0,
                    format!("MutScan '{reference}' vs '{input}': {} tag(s)", result.tags.len()),
                );
            }
            Operation::TraceDiff { reference, input } => {
                let reference_trace = lookup(&self.state.traces, &reference)?;
                let input_trace = lookup(&self.state.traces, &input)?;
                let outcome = tracediff::analyse(
                    reference_trace,
                    input_trace,
                    &self.state.parameters,
                    &mut self.cache,
                )?;
                Self::absorb(&mut result, outcome);
                result.messages.insert(
                    0,
                    format!(
                        "TraceDiff '{reference}' vs '{input}': {} tag(s)",
                        result.tags.len()
                    ),
                );
            }
            Operation::TraceAlign {
                reference,
                input,
                output_prefix,
            } => {
                let params = &self.state.parameters;
                let reference_trace = lookup(&self.state.traces, &reference)?;
                let input_trace = lookup(&self.state.traces, &input)?;
                validate_trace(reference_trace, "Reference")?;
                validate_trace(input_trace, "Input")?;
                params.validate_alignment()?;
                let alignment =
                    TraceAligner::new(&mut self.cache, params).align(reference_trace, input_trace)?;
                let (mut aligned_reference, mut aligned_input) = interpolate(
                    reference_trace,
                    input_trace,
                    &alignment.path,
                    base_tolerance(reference_trace),
                );
                if alignment.failed() {
                    result.result_code = ResultCode::AlignmentFailure;
                }
                result.warnings.extend(alignment.warnings());
                result.messages.push(format!(
                    "Aligned '{input}' to '{reference}': {} column(s), {} chunk(s), diagonal {:.3}",
                    alignment.path.len(),
                    alignment.chunks.len(),
                    alignment.path.diagonal_fraction()
                ));

                let prefix = output_prefix.unwrap_or_else(|| format!("{reference}_{input}"));
                for (suffix, trace) in [
                    ("reference", &mut aligned_reference),
                    ("input", &mut aligned_input),
                ] {
                    let trace_id = self.unique_trace_id(&format!("{prefix}_{suffix}"));
                    trace.name = trace_id.clone();
                    self.state.traces.insert(trace_id.clone(), trace.clone());
                    result.created_trace_ids.push(trace_id);
                }
            }
            Operation::SetParameter { name, value } => {
                self.state.parameters.set_by_name(&name, &value)?;
                let stored = self
                    .state
                    .parameters
                    .get_by_name(&name)
                    .unwrap_or(serde_json::Value::Null);
                result
                    .messages
                    .push(format!("Set parameter '{name}' to {stored}"));
            }
            Operation::ResetParameters => {
                self.state.parameters.reset();
                result
                    .messages
                    .push("Reset all parameters to their defaults".to_string());
            }
            Operation::FlushCache => {
                self.cache.flush();
                result.messages.push("Flushed alignment cache".to_string());
            }
        }

        info!("{run_id}/{}: {:?}", result.op_id, result.result_code);
        Ok(result)
    }
}

impl Engine for TraceEngine {
    fn apply(&mut self, op: Operation) -> Result<OpResult, EngineError> {
        let run_id = "interactive".to_string();
        let result = self.apply_internal(op.clone(), &run_id)?;
        self.journal.push(OperationRecord {
            run_id,
            op,
            result: result.clone(),
        });
        Ok(result)
    }

    fn apply_workflow(&mut self, wf: Workflow) -> Result<Vec<OpResult>, EngineError> {
        let mut results = Vec::new();
        for op in &wf.ops {
            let result = self.apply_internal(op.clone(), &wf.run_id)?;
            self.journal.push(OperationRecord {
                run_id: wf.run_id.clone(),
                op: op.clone(),
                result: result.clone(),
            });
            results.push(result);
        }
        Ok(results)
    }

    fn snapshot(&self) -> &ProjectState {
        &self.state
    }
}
