//! `afe-watch` library crate.
//!
//! Re-exports the lecture-range runner and report rendering for
//! integration testing. The binary entrypoint lives in `main.rs`.

pub mod report;
pub mod runner;
