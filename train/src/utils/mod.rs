//! Misc utilities.

mod checkpoint;
mod lr_scheduler;
mod throughput;

pub use checkpoint::*;
pub use lr_scheduler::*;
pub use throughput::*;
