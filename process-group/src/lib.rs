//! Collective operations among cooperating training workers.

mod common;
mod local;
mod single;

pub use local::*;
pub use single::*;

use crate::common::*;

/// A group of workers that exchange data through blocking collectives.
///
/// Every collective is a barrier. All workers must issue the same sequence
/// of collectives, otherwise the whole group stalls at the next one.
pub trait ProcessGroup: Send + Sync {
    /// The index of this worker in `0..world_size`.
    fn rank(&self) -> usize;

    /// The number of workers in the group.
    fn world_size(&self) -> usize;

    /// Collects one payload from every worker, ordered by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    fn barrier(&self) -> Result<()> {
        self.all_gather_bytes(vec![])?;
        Ok(())
    }

    /// Element-wise sum over all workers, written back into `values`.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        if self.world_size() < 2 {
            return Ok(());
        }

        let payload = values.iter().flat_map(|value| value.to_le_bytes()).collect_vec();
        let gathered = self.all_gather_bytes(payload)?;

        values.iter_mut().for_each(|value| *value = 0.0);

        for (rank, bytes) in gathered.into_iter().enumerate() {
            ensure!(
                bytes.len() == values.len() * 8,
                "worker {} contributed {} values, but {} are expected",
                rank,
                bytes.len() / 8,
                values.len()
            );

            for (sum, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
                let chunk: [u8; 8] = chunk.try_into()?;
                *sum += f64::from_le_bytes(chunk);
            }
        }

        Ok(())
    }
}

/// Helpers built on top of the [ProcessGroup] primitives.
pub trait ProcessGroupExt: ProcessGroup {
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Collects a serializable value from every worker, ordered by rank.
    fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_vec(value)?;
        self.all_gather_bytes(payload)?
            .into_iter()
            .map(|bytes| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }

    /// Averages named scalars over all workers.
    ///
    /// Names are sorted before the reduction so that workers inserting the
    /// same names in different orders still reduce matching entries. The
    /// output follows the key order of `dict`.
    fn reduce_mean_dict(&self, dict: &IndexMap<String, f64>) -> Result<IndexMap<String, f64>> {
        let world_size = self.world_size();
        if world_size < 2 {
            return Ok(dict.clone());
        }

        let keys = dict.keys().sorted().collect_vec();
        let mut values = keys.iter().map(|&key| dict[key]).collect_vec();
        self.all_reduce_sum(&mut values)?;

        let reduced: HashMap<_, _> = keys.into_iter().zip(values).collect();
        let output = dict
            .keys()
            .map(|key| (key.clone(), reduced[key] / world_size as f64))
            .collect();

        Ok(output)
    }
}

impl<G> ProcessGroupExt for G where G: ProcessGroup + ?Sized {}
