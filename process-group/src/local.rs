use crate::{common::*, ProcessGroup};

/// A group whose workers are threads of the current process.
///
/// Each worker owns one [LocalGroupHandle] and must run on its own thread,
/// since every collective blocks until all handles reach it.
#[derive(Debug)]
pub struct LocalGroup {
    _private: (),
}

impl LocalGroup {
    /// Creates the handles of a group of `world_size` workers, in rank order.
    pub fn new(world_size: usize) -> Result<Vec<LocalGroupHandle>> {
        ensure!(world_size > 0, "world_size must be positive");

        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });

        let handles = (0..world_size)
            .map(|rank| LocalGroupHandle {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect();
        Ok(handles)
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

/// One worker's view of a [LocalGroup].
#[derive(Debug, Clone)]
pub struct LocalGroupHandle {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl ProcessGroup for LocalGroupHandle {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let Self { rank, ref shared, .. } = *self;

        let written = shared
            .slots
            .lock()
            .map(|mut slots| slots[rank] = Some(payload))
            .map_err(|_| format_err!("the slot table of worker {} is poisoned", rank));
        shared.barrier.wait();

        let gathered: Result<Vec<_>> = written.and_then(|()| {
            let slots = shared
                .slots
                .lock()
                .map_err(|_| format_err!("the slot table of worker {} is poisoned", rank))?;
            slots
                .iter()
                .enumerate()
                .map(|(peer, slot)| {
                    slot.clone()
                        .ok_or_else(|| format_err!("worker {} did not contribute a payload", peer))
                })
                .collect()
        });

        // the next round may overwrite slots only after every worker has read them
        shared.barrier.wait();
        gathered
    }
}
