//! Smoothed metric tracking with a synchronized read-out across workers.

mod common;
mod logger;
mod smoothed_value;

pub use logger::*;
pub use smoothed_value::*;
