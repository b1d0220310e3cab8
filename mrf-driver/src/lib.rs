//! A serverless MapReduce driver.
//!
//! A driver takes one or more [`Job`]s, cuts their inputs into splits,
//! packs splits into map bins, and schedules map and reduce tasks with
//! bounded parallelism onto an executor: in-process, AWS Lambda or
//! OpenWhisk. Multi-stage pipelines chain automatically, each stage
//! consuming the previous stage's `output-*` files.
//!
//! The same binary acts as driver and as remote worker. Inside a
//! cloud-function environment the process detects its role and serves
//! tasks instead of orchestrating.

mod args;
pub mod config;
pub mod driver;
pub mod executor;
pub mod job;
pub mod lambda;
mod phase;
pub mod split;
pub mod whisk;

pub use config::{Backend, Config};
pub use driver::Driver;
pub use executor::{Executor, LocalExecutor, Platform, PlatformError, TaskError};
pub use job::Job;
pub use split::InputSplit;
