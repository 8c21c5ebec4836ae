//! Resources shared by the training and evaluation loops.

use crate::{common::*, logging::ExperimentSink};

/// Borrows the model, its criterion and the process-wide resources for one
/// pass over the data.
pub struct EngineContext<'a, M, C> {
    pub model: &'a mut M,
    pub criterion: &'a mut C,
    pub device: Device,
    pub group: &'a dyn ProcessGroup,
    /// Receives scalars and predictions. Only the main process writes to it.
    pub sink: &'a dyn ExperimentSink,
}
