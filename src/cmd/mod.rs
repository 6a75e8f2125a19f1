//! Command-line entry points.

pub mod allocation;
pub mod config;
pub mod run;
pub mod schema;
