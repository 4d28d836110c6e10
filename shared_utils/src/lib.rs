//! Small helpers shared across workspace crates.

pub mod env;
