use crate::{common::*, ProcessGroup};

/// The trivial group of a non-distributed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }
}
