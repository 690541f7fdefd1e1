//! # llmdocs
//!
//! Condenses a large, multi-file documentation corpus into one compact reference
//! document for LLM consumption.
//!
//! ## Features
//!
//! - Topic-tagged extraction with `.gitignore` support and skip patterns
//! - Chunked reduction of texts that exceed a per-call size limit
//! - Tree reduction with a configurable branching factor
//! - Bounded worker pools with order-preserving fan-in
//! - Partial failure tolerance with a configurable fallback policy
//! - Append-only, versioned release candidates
//!
//! ## Quick Start
//!
//! ```no_run
//! use llmdocs::{Config, HttpModel, Pipeline};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .source_dir("./docs")
//!     .output_dir("./output")
//!     .ratio(4)
//!     .build()?;
//!
//! let model = Arc::new(HttpModel::from_config(&config.llm)?);
//! Pipeline::new(config, model)?.run()?.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Five stages, each reading the artifact directory of the previous one:
//! 1. **Extract**: Parses documents into topic fragments
//! 2. **Merge**: Condenses the fragments of each topic
//! 3. **Reduce**: Tree-reduces the topics into one document
//! 4. **Compress**: Formats and minifies the document
//! 5. **Release**: Publishes the next versioned copy

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod artifact;
mod compress;
mod condense;
mod config;
mod document;
mod error;
mod extract;
mod filter;
mod llm;
mod merge;
mod pipeline;
mod pool;
mod reduce;
mod release;
mod report;
mod template;
mod token;

pub use compress::minify;
pub use condense::{split_into_chunks, CondensationResult, Condenser};
pub use config::{
    CompressionConfig, Config, ConfigBuilder, ExtractionConfig, FailurePolicy, HierarchicalConfig,
    LlmConfig, MergeConfig, ProcessingConfig, PromptConfig, ReleaseConfig, TopicConfig,
};
pub use document::{DocFile, DocSection, ROOT_CATEGORY};
pub use error::{Error, Result};
pub use extract::CorpusStats;
pub use llm::{Backoff, HttpModel, LanguageModel, LlmError, RetryPolicy};
pub use pipeline::{Pipeline, PipelineStats};
pub use reduce::{pass_count, plan_groups, PassSummary, UNIFIED_DOCUMENT};
pub use release::{parse_version, ReleaseEntry, ReleaseManager};
pub use report::{FailureRecord, Stage, StageReport};
pub use token::{compression_ratio, CharEstimator, TokenEstimator};

use std::sync::Arc;

/// Runs the complete pipeline with the given configuration and model.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - The source directory doesn't exist or holds no documents
/// - A stage artifact cannot be read or written
/// - The formatting pass fails under the `drop` policy
///
/// # Examples
///
/// ```no_run
/// use llmdocs::{run, Config, HttpModel};
/// use std::sync::Arc;
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::load("config.yaml".as_ref())?;
/// let model = Arc::new(HttpModel::from_config(&config.llm)?);
///
/// run(config, model)?;
/// # Ok(())
/// # }
/// ```
pub fn run(config: Config, model: Arc<dyn LanguageModel>) -> Result<PipelineStats> {
    Pipeline::new(config, model)?.run()
}
