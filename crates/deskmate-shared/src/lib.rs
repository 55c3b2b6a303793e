//! Shared types for the Deskmate diagnostic pipeline.
//!
//! Everything that crosses a component boundary lives here: inbound requests,
//! the Diagnosis payload, passages, sessions and the error taxonomy.

pub mod category;
pub mod diagnosis;
pub mod error;
pub mod feedback;
pub mod passage;
pub mod request;
pub mod rpc;
pub mod session;

pub use category::Category;
pub use diagnosis::{Cause, Diagnosis, DiagnosisKind, Hazard, RiskLevel, Step};
pub use error::{IndexError, PipelineError, ProviderError};
pub use feedback::{FeedbackOutcome, FeedbackRating, FeedbackRequest};
pub use passage::{KnownCause, KnownStep, Likelihood, Passage, PassageMetadata};
pub use request::{ChatRequest, DeviceInfo, HistoryMessage, TechnicalLevel};
pub use session::{Role, Session, Turn};

/// Crate version, reported by the daemon.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
