//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{DateTime, Local};
pub use futures::future::{Future, FutureExt};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use metric_logger::{MeterConfig, MetricLogger, SyncedMetrics};
pub use noisy_float::prelude::*;
pub use process_group::{ProcessGroup, ProcessGroupExt};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::Debug,
    fs,
    io::Write as _,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{
    ColorSpace, EventAsyncWriter, EventWriterConfig, TchChannelOrder, TchTensorAsImage,
};
pub use tokio::sync::broadcast;
pub use tracing::{error, info, warn};

pub type Fallible<T> = Result<T, Error>;
