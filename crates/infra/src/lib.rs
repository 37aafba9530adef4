//! Infrastructure layer: stores, job queue, orchestration and configuration
//! for the audiobook processing pipeline.

pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
pub mod upload_tracker;


pub use config::{ConfigError, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{
    AudioBookStatusView, JobStatusReport, Pipeline, PromotionOutcome, ReportOutcome,
    RetryAllReport,
};
