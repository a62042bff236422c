pub mod classify;
pub mod cli;
pub mod commands;
pub mod config;
pub mod drizzle;
pub mod error;
pub mod fits;
pub mod frame;
pub mod master;
pub mod output;
pub mod pipeline;
pub mod reconstruct;
pub mod registration;
pub mod rejection;
pub mod stars;
pub mod statistics;
pub mod store;

#[cfg(test)]
mod test_pipeline;

// Re-export commonly used items
pub use config::PipelineConfig;
pub use error::{FrameSkip, StackError};
pub use pipeline::{CancelToken, Pipeline, RunReport, RunStatus, RunWarning};
pub use store::{FitsStore, RasterStore};
