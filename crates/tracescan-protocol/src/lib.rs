//! Data contracts shared between the TRACEscan engine, its command line front
//! end and whatever decoder produced the traces.

pub mod tag;
pub mod trace;

pub use tag::{
    BaseCall, MutationTag, TagType, INPUT_BASE, INPUT_SAMPLE, MAX_TAG_CALLS, REFERENCE_BASE,
    REFERENCE_SAMPLE, TAG_POSITIONS,
};
pub use trace::{base_channel, complement_base, Strand, Trace, CHANNELS, CHANNEL_BASES, PAD_BASE};
