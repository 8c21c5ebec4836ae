pub use anyhow::{ensure, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use process_group::{ProcessGroup, ProcessGroupExt};
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::VecDeque,
    fmt::{self, Display},
    time::{Duration, Instant},
};
pub use tracing::info;
