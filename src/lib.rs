// src/lib.rs
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod process;

pub use config::{OutputFormat, PipelineConfig, RunParams, RunPaths, Strictness};
pub use error::PnadcError;
pub use pipeline::{run, RunLock, RunReport, StageOutcome};
