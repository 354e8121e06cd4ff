use crate::engine::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// A named tunable with its default and valid range.
///
/// Setting a value never checks the range; `validate` is called by each
/// operation before it reads the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameter<T> {
    name: &'static str,
    value: T,
    default: T,
    min: T,
    max: T,
}

impl<T: Copy + PartialOrd + Display> Parameter<T> {
    pub fn new(name: &'static str, default: T, min: T, max: T) -> Self {
        Self {
            name,
            value: default,
            default,
            min,
            max,
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn value(&self) -> T {
        self.value
    }

    #[inline(always)]
    pub fn default_value(&self) -> T {
        self.default
    }

    #[inline(always)]
    pub fn min(&self) -> T {
        self.min
    }

    #[inline(always)]
    pub fn max(&self) -> T {
        self.max
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    pub fn reset(&mut self) {
        self.value = self.default;
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.value && self.value <= self.max
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.is_valid() {
            return Ok(());
        }
        Err(EngineError {
            code: ErrorCode::InvalidInput,
            message: format!(
                "Parameter '{}' value {} outside valid range [{}, {}]",
                self.name, self.value, self.min, self.max
            ),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub kind: String,
    pub value: serde_json::Value,
    pub default: serde_json::Value,
    pub min: serde_json::Value,
    pub max: serde_json::Value,
    pub valid: bool,
}

impl ParameterInfo {
    fn from_parameter<T>(p: &Parameter<T>, kind: &str) -> Self
    where
        T: Copy + PartialOrd + Display + Into<serde_json::Value>,
    {
        Self {
            name: p.name().to_string(),
            kind: kind.to_string(),
            value: p.value().into(),
            default: p.default_value().into(),
            min: p.min().into(),
            max: p.max().into(),
            valid: p.is_valid(),
        }
    }
}

macro_rules! analysis_parameters {
    (
        reals { $($rname:ident = ($rdef:expr, $rmin:expr, $rmax:expr)),* $(,)? }
        integers { $($iname:ident = ($idef:expr, $imin:expr, $imax:expr)),* $(,)? }
    ) => {
        /// Every tunable the analysis reads, with the current values.
        #[derive(Debug, Clone, PartialEq)]
        pub struct AnalysisParameters {
            $(pub $rname: Parameter<f64>,)*
            $(pub $iname: Parameter<i32>,)*
        }

        impl Default for AnalysisParameters {
            fn default() -> Self {
                Self {
                    $($rname: Parameter::new(stringify!($rname), $rdef, $rmin, $rmax),)*
                    $($iname: Parameter::new(stringify!($iname), $idef, $imin, $imax),)*
                }
            }
        }

        impl AnalysisParameters {
            pub fn names() -> Vec<&'static str> {
                vec![$(stringify!($rname),)* $(stringify!($iname),)*]
            }

            /// Set a parameter from a JSON number.
            pub fn set_by_name(
                &mut self,
                name: &str,
                value: &serde_json::Value,
            ) -> Result<(), EngineError> {
                match name {
                    $(stringify!($rname) => self.$rname.set(Self::real_value(name, value)?),)*
                    $(stringify!($iname) => self.$iname.set(Self::integer_value(name, value)?),)*
                    _ => {
                        return Err(EngineError {
                            code: ErrorCode::Unsupported,
                            message: format!("Unknown parameter '{name}'"),
                        });
                    }
                }
                Ok(())
            }

            pub fn get_by_name(&self, name: &str) -> Option<serde_json::Value> {
                match name {
                    $(stringify!($rname) => Some(self.$rname.value().into()),)*
                    $(stringify!($iname) => Some(self.$iname.value().into()),)*
                    _ => None,
                }
            }

            pub fn reset(&mut self) {
                $(self.$rname.reset();)*
                $(self.$iname.reset();)*
            }

            pub fn describe(&self) -> Vec<ParameterInfo> {
                vec![
                    $(ParameterInfo::from_parameter(&self.$rname, "real"),)*
                    $(ParameterInfo::from_parameter(&self.$iname, "integer"),)*
                ]
            }
        }
    };
}

analysis_parameters! {
    reals {
        noise_threshold = (0.15, 0.0, 1.0),
        peak_search_window = (0.5, 0.1, 2.0),
        scale_outlier_sd = (2.0, 0.5, 10.0),
        lower_peak_drop = (0.2, 0.0, 1.0),
        upper_peak_drop = (0.8, 0.0, 1.0),
        diff_sensitivity = (0.25, 0.01, 1.0),
        envelope_lower = (0.0, 0.0, 1.0),
        envelope_upper = (1.0, 0.0, 1.0),
        alignment_failure_threshold = (0.5, 0.0, 1.0),
    }
    integers {
        ambiguity_calls = (1, 0, 1),
        ambiguity_window = (2, 0, 20),
        complement_tags = (0, 0, 1),
        quantisation_levels = (16, 2, 255),
        gap_open = (16, 0, 10000),
        gap_extend = (4, 0, 10000),
        edge_scoring = (0, 0, 1),
        chunk_length = (1000, 50, 20000),
        chunk_overlap = (100, 10, 10000),
        sync_window = (3, 1, 20),
        max_lookahead = (20, 2, 200),
    }
}

fn cross_check(ok: bool, message: String) -> Result<(), EngineError> {
    if ok {
        Ok(())
    } else {
        Err(EngineError {
            code: ErrorCode::InvalidInput,
            message,
        })
    }
}

impl AnalysisParameters {
    fn real_value(name: &str, value: &serde_json::Value) -> Result<f64, EngineError> {
        value.as_f64().ok_or_else(|| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("SetParameter {name} requires a number, got {value}"),
        })
    }

    fn integer_value(name: &str, value: &serde_json::Value) -> Result<i32, EngineError> {
        let raw = match value.as_i64() {
            Some(raw) => raw,
            None => match value.as_f64() {
                Some(f) if f.fract() == 0.0 && f.is_finite() => f as i64,
                _ => {
                    return Err(EngineError {
                        code: ErrorCode::InvalidInput,
                        message: format!("SetParameter {name} requires an integer, got {value}"),
                    });
                }
            },
        };
        // Out of range values are kept so that validation can name them.
        Ok(raw.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }

    /// Parameters read by the peak finder.
    pub fn validate_preprocess(&self) -> Result<(), EngineError> {
        self.noise_threshold.validate()?;
        self.peak_search_window.validate()
    }

    pub fn validate_mutscan(&self) -> Result<(), EngineError> {
        self.validate_preprocess()?;
        self.scale_outlier_sd.validate()?;
        self.lower_peak_drop.validate()?;
        self.upper_peak_drop.validate()?;
        self.diff_sensitivity.validate()?;
        self.ambiguity_calls.validate()?;
        self.ambiguity_window.validate()?;
        self.complement_tags.validate()?;
        cross_check(
            self.lower_peak_drop.value() < self.upper_peak_drop.value(),
            format!(
                "lower_peak_drop {} must be below upper_peak_drop {}",
                self.lower_peak_drop.value(),
                self.upper_peak_drop.value()
            ),
        )
    }

    pub fn validate_alignment(&self) -> Result<(), EngineError> {
        self.validate_preprocess()?;
        self.quantisation_levels.validate()?;
        self.envelope_lower.validate()?;
        self.envelope_upper.validate()?;
        self.gap_open.validate()?;
        self.gap_extend.validate()?;
        self.edge_scoring.validate()?;
        self.chunk_length.validate()?;
        self.chunk_overlap.validate()?;
        self.alignment_failure_threshold.validate()?;
        cross_check(
            self.envelope_lower.value() < self.envelope_upper.value(),
            format!(
                "envelope_lower {} must be below envelope_upper {}",
                self.envelope_lower.value(),
                self.envelope_upper.value()
            ),
        )?;
        cross_check(
            2 * self.chunk_overlap.value() < self.chunk_length.value(),
            format!(
                "chunk_overlap {} must be less than half of chunk_length {}",
                self.chunk_overlap.value(),
                self.chunk_length.value()
            ),
        )
    }

    pub fn validate_tracediff(&self) -> Result<(), EngineError> {
        self.validate_mutscan()?;
        self.validate_alignment()?;
        self.sync_window.validate()?;
        self.max_lookahead.validate()?;
        cross_check(
            self.sync_window.value() < self.max_lookahead.value(),
            format!(
                "sync_window {} must be below max_lookahead {}",
                self.sync_window.value(),
                self.max_lookahead.value()
            ),
        )
    }

    #[inline(always)]
    pub fn ambiguity_enabled(&self) -> bool {
        self.ambiguity_calls.value() == 1
    }

    #[inline(always)]
    pub fn complement_enabled(&self) -> bool {
        self.complement_tags.value() == 1
    }

    #[inline(always)]
    pub fn edge_scoring_enabled(&self) -> bool {
        self.edge_scoring.value() == 1
    }
}

impl From<AnalysisParameters> for BTreeMap<String, serde_json::Value> {
    fn from(params: AnalysisParameters) -> Self {
        AnalysisParameters::names()
            .into_iter()
            .filter_map(|name| Some((name.to_string(), params.get_by_name(name)?)))
            .collect()
    }
}

impl TryFrom<BTreeMap<String, serde_json::Value>> for AnalysisParameters {
    type Error = EngineError;

    fn try_from(map: BTreeMap<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let mut params = Self::default();
        for (name, value) in &map {
            params.set_by_name(name, value)?;
        }
        Ok(params)
    }
}

impl Serialize for AnalysisParameters {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BTreeMap::<String, serde_json::Value>::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AnalysisParameters {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Self::try_from(map).map_err(serde::de::Error::custom)
    }
}
