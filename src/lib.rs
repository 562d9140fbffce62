//! A hierarchical test harness: named tests with nested subtests, buffered
//! per-test logs, and a mix of sequential and parallel execution bounded by
//! a global concurrency gate.

pub mod cli;
pub mod error;
pub mod runner;
pub mod suite;

pub use error::HarnessError;
pub use runner::{Context, CountingGate, H, ParallelGate, UnboundedGate};
pub use suite::{Options, Suite, SuiteReport};
