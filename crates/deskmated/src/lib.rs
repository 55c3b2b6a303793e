//! Deskmate daemon library - the diagnostic reasoning pipeline.
//!
//! request -> normalizer -> index -> ranker -> analyzer -> composer -> safety

pub mod analyzer;
pub mod classifier;
pub mod composer;
pub mod config;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod normalizer;
pub mod pipeline;
pub mod prompts;
pub mod ranker;
pub mod render;
pub mod safety;
pub mod server;
pub mod sessions;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineStatus, ProblemAnalysis};
pub use sessions::SessionStore;
