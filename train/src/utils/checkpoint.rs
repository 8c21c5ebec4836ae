use crate::{common::*, config::LoadCheckpoint, optim::Checkpoint};
use chrono::FixedOffset;
use once_cell::sync::Lazy;
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    let datetime = r"\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4}";
    Regex::new(&format!(r"^({})_(\d+)_[-+0-9.a-zA-Z]+\.ckpt$", datetime)).unwrap()
});

/// A checkpoint file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub path: PathBuf,
    /// The epoch after which the file was written, if the file name tells it.
    pub epoch: Option<usize>,
}

/// Names the checkpoint file of `epoch` by the wall-clock time, the epoch and
/// the averaged training loss.
pub fn checkpoint_filename(time: &DateTime<Local>, epoch: usize, loss: f64) -> String {
    format!("{}_{:06}_{:08.5}.ckpt", time.format(FILE_STRFTIME), epoch, loss)
}

/// Parses a file name produced by [checkpoint_filename].
pub fn parse_checkpoint_filename(file_name: &str) -> Option<(DateTime<FixedOffset>, usize)> {
    let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
    let datetime = DateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
    let epoch = captures.get(2)?.as_str().parse().ok()?;
    Some((datetime, epoch))
}

/// Saves parameters to a checkpoint file in `checkpoint_dir`.
pub fn save_checkpoint<C>(
    params: &C,
    checkpoint_dir: &Path,
    epoch: usize,
    loss: f64,
) -> Result<PathBuf>
where
    C: Checkpoint + ?Sized,
{
    let path = checkpoint_dir.join(checkpoint_filename(&Local::now(), epoch, loss));
    params.save_checkpoint(&path)?;
    info!("saved checkpoint file {}", path.display());
    Ok(path)
}

/// Finds the checkpoint file selected by `load_checkpoint`.
///
/// Recent checkpoints are searched in the `checkpoints` directories of every
/// run under `logging_dir`. The epoch of an explicitly given file is known
/// only if its name follows [checkpoint_filename].
pub fn find_checkpoint(
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<CheckpointFile>> {
    let found = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
            let paths = glob::glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
            let recent = paths
                .into_iter()
                .filter_map(|path| {
                    let file_name = path.file_name()?.to_str()?;
                    let (datetime, epoch) = parse_checkpoint_filename(file_name)?;
                    Some((
                        datetime,
                        CheckpointFile {
                            path,
                            epoch: Some(epoch),
                        },
                    ))
                })
                .max_by_key(|(datetime, _)| *datetime)
                .map(|(_, file)| file);

            if recent.is_none() {
                warn!("no checkpoint file found");
            }
            recent
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "{} is not a file", file.display());
            let epoch = file
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_checkpoint_filename)
                .map(|(_, epoch)| epoch);
            if epoch.is_none() {
                warn!(
                    "cannot tell the epoch of {}, training from epoch 0",
                    file.display()
                );
            }
            Some(CheckpointFile {
                path: file.clone(),
                epoch,
            })
        }
    };

    Ok(found)
}

/// Loads parameters with specified checkpoint loading method and returns the
/// loaded file.
pub fn try_load_checkpoint<C>(
    params: &mut C,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<CheckpointFile>>
where
    C: Checkpoint + ?Sized,
{
    let found = find_checkpoint(logging_dir, load_checkpoint)?;
    if let Some(CheckpointFile { path, .. }) = &found {
        info!("load checkpoint file {}", path.display());
        params.load_checkpoint(path)?;
    }
    Ok(found)
}
