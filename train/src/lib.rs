//! Training and evaluation loops for set-prediction object detectors.
//!
//! The crate drives a [Model](model::Model) and its
//! [Criterion](model::Criterion) through epochs of gradient-accumulated
//! training and through evaluation passes that feed COCO-style and panoptic
//! evaluators. Models, criteria, data loaders and evaluator back-ends are
//! supplied by the caller. Metrics are averaged over all workers of a
//! [ProcessGroup](process_group::ProcessGroup) and optionally forwarded to
//! an [ExperimentSink](logging::ExperimentSink).
//!
//! A run whose loss turns non-finite fails with
//! [NonFiniteLoss](error::NonFiniteLoss). Binaries embedding the crate are
//! expected to end the process with
//! `std::process::exit(NonFiniteLoss::EXIT_CODE)` in that case, for example
//! through [exit_code](error::exit_code):
//!
//! ```no_run
//! # fn run() -> anyhow::Result<()> { Ok(()) }
//! if let Err(err) = run() {
//!     eprintln!("{:#}", err);
//!     std::process::exit(detr_train::error::exit_code(&err).unwrap_or(2));
//! }
//! ```

pub mod batch;
pub mod common;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluate;
pub mod evaluator;
pub mod fit;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod postprocess;
pub mod train;
pub mod utils;
pub mod visualize;

pub use metric_logger;
pub use process_group;
