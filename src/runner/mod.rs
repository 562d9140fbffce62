//! The execution engine: units, their lifecycle and the parent/child
//! signaling protocol.

pub mod context;
pub mod env;
pub mod gate;
pub mod latch;
pub(crate) mod lifecycle;
pub mod output;
mod protocol;
pub mod unit;

pub use context::Context;
pub use env::{Environment, NameResolver, Sink};
pub use gate::{CountingGate, ParallelGate, UnboundedGate};
pub use unit::H;
