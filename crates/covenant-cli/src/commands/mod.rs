//! CLI command implementations.

pub mod check_bundle;
pub mod digest;
