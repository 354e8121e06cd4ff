pub mod about;
pub mod caller;
pub mod engine;
pub mod interpolate;
pub mod iupac_code;
pub mod mutscan;
pub mod parameter;
pub mod preprocess;
pub mod scale;
pub mod trace_align;
pub mod tracediff;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use tracescan_protocol::{
    BaseCall, MutationTag, Strand, TagType, Trace, CHANNELS, CHANNEL_BASES, PAD_BASE,
};
