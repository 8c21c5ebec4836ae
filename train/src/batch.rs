//! Batches as produced by the data loader.

use crate::common::*;

/// The annotations of one image.
#[derive(Debug, TensorLike)]
pub struct Target {
    #[tensor_like(clone)]
    pub image_id: i64,
    /// Class indices in `[num_objects]` shape.
    pub labels: Tensor,
    /// Normalized boxes in `[num_objects, 4]` shape.
    pub boxes: Tensor,
    /// Height and width of the image file.
    #[tensor_like(clone)]
    pub orig_size: [i64; 2],
    /// Height and width after resizing, as fed to the model.
    #[tensor_like(clone)]
    pub size: [i64; 2],
    /// The image file. This is host metadata and never moves to a device.
    #[tensor_like(clone)]
    pub path: Option<PathBuf>,
}

impl Clone for Target {
    fn clone(&self) -> Self {
        self.shallow_clone()
    }
}

/// One micro-batch of samples along with the targets of each frame.
///
/// Video-style loaders yield one list of targets per frame, so targets are
/// nested. They are flattened when the batch is moved to the device.
#[derive(Debug)]
pub struct Batch<I> {
    pub samples: I,
    pub targets: Vec<Vec<Target>>,
}

impl<I> Batch<I>
where
    I: TensorLike,
{
    /// Moves samples and targets to `device`, flattening the per-frame
    /// target lists into a single list.
    pub fn into_device(self, device: Device) -> (I, Vec<Target>) {
        let Self { samples, targets } = self;
        let samples = samples.to_device(device);
        let targets = targets
            .into_iter()
            .flatten()
            .map(|target| target.to_device(device))
            .collect();
        (samples, targets)
    }
}

/// Stacks one `[height, width]` pair per target into an `[N, 2]` tensor.
pub fn stack_sizes(
    targets: &[Target],
    size_of: impl Fn(&Target) -> [i64; 2],
    device: Device,
) -> Tensor {
    let flat = targets.iter().flat_map(size_of).collect_vec();
    Tensor::of_slice(&flat)
        .view([targets.len() as i64, 2])
        .to_device(device)
}
