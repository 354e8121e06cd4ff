use crate::trace::{complement_base, Strand};
use serde::{Deserialize, Serialize};

pub const TAG_POSITIONS: usize = 4;
pub const MAX_TAG_CALLS: usize = 3;

// Slots of `MutationTag::positions`.
pub const INPUT_BASE: usize = 0;
pub const INPUT_SAMPLE: usize = 1;
pub const REFERENCE_BASE: usize = 2;
pub const REFERENCE_SAMPLE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagType {
    /// Two alleles at one column.
    Hete,
    /// Clean substitution.
    Muta,
}

impl TagType {
    pub fn code(self) -> &'static str {
        match self {
            Self::Hete => "HETE",
            Self::Muta => "MUTA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseCall {
    pub base: char,
    pub amplitude: i32,
}

/// One candidate mutation.
///
/// Calls are ordered reference, input primary, input secondary. Tags are not
/// edited after construction; complementing builds a new tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationTag {
    tag_type: TagType,
    strand: Strand,
    positions: [usize; TAG_POSITIONS],
    calls: Vec<BaseCall>,
    snr: f64,
    peak_drop: Option<f64>,
    #[serde(default)]
    marked: bool,
    #[serde(default)]
    row: i32,
    #[serde(default)]
    col: i32,
}

impl MutationTag {
    pub fn new(
        tag_type: TagType,
        strand: Strand,
        positions: [usize; TAG_POSITIONS],
        mut calls: Vec<BaseCall>,
        snr: f64,
        peak_drop: Option<f64>,
    ) -> Self {
        debug_assert!(calls.len() <= MAX_TAG_CALLS);
        calls.truncate(MAX_TAG_CALLS);
        Self {
            tag_type,
            strand,
            positions,
            calls,
            snr,
            peak_drop,
            marked: false,
            row: 0,
            col: 0,
        }
    }

    /// Display placement, only meaningful to whoever renders the tag.
    pub fn with_display(mut self, row: i32, col: i32, marked: bool) -> Self {
        self.row = row;
        self.col = col;
        self.marked = marked;
        self
    }

    #[inline(always)]
    pub fn tag_type(&self) -> TagType {
        self.tag_type
    }

    #[inline(always)]
    pub fn code(&self) -> &'static str {
        self.tag_type.code()
    }

    #[inline(always)]
    pub fn strand(&self) -> Strand {
        self.strand
    }

    #[inline(always)]
    pub fn positions(&self) -> &[usize; TAG_POSITIONS] {
        &self.positions
    }

    #[inline(always)]
    pub fn position(&self, slot: usize) -> usize {
        self.positions[slot]
    }

    #[inline(always)]
    pub fn calls(&self) -> &[BaseCall] {
        &self.calls
    }

    #[inline(always)]
    pub fn snr(&self) -> f64 {
        self.snr
    }

    #[inline(always)]
    pub fn peak_drop(&self) -> Option<f64> {
        self.peak_drop
    }

    #[inline(always)]
    pub fn marked(&self) -> bool {
        self.marked
    }

    #[inline(always)]
    pub fn row(&self) -> i32 {
        self.row
    }

    #[inline(always)]
    pub fn col(&self) -> i32 {
        self.col
    }

    /// `"{ref}->{input}, SNR={x}dB[, PKD={y}]"`; PKD only on heterozygotes.
    pub fn comment(&self) -> String {
        let base = |i: usize| self.calls.get(i).map(|c| c.base).unwrap_or('-');
        let mut text = format!("{}->{}, SNR={:.2}dB", base(0), base(1), self.snr);
        if let (TagType::Hete, Some(pkd)) = (self.tag_type, self.peak_drop) {
            text.push_str(&format!(", PKD={pkd:.2}"));
        }
        text
    }

    /// Mirror every position inside its extent (the length of the base list or
    /// sample array the slot indexes) and complement the called bases.
    pub fn complemented(&self, extents: [usize; TAG_POSITIONS]) -> Self {
        let mut positions = self.positions;
        for (pos, extent) in positions.iter_mut().zip(extents) {
            if extent > 0 {
                *pos = extent - 1 - (*pos).min(extent - 1);
            }
        }
        let calls = self
            .calls
            .iter()
            .map(|c| BaseCall {
                base: complement_base(c.base),
                amplitude: c.amplitude,
            })
            .collect();
        Self {
            positions,
            calls,
            ..self.clone()
        }
    }
}
