//! Chat-facing rendering of session state.

pub mod embeds;
