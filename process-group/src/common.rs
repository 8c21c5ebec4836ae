pub use anyhow::{ensure, format_err, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use serde::{de::DeserializeOwned, Serialize};
pub use std::{
    collections::HashMap,
    convert::TryInto,
    sync::{Arc, Barrier, Mutex},
};
