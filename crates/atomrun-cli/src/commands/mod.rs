//! CLI command implementations.

pub mod check_runners;
pub mod clean;
pub mod common;
pub mod multi;
pub mod reposition;
pub mod runner;
pub mod serve;
pub mod sleep;
pub mod status;
