//! Generation job lifecycle engine: submit a request to the backend,
//! poll status to a terminal state, resolve output artifacts through the
//! ordered fallback chain, and track elapsed-time telemetry.

pub mod backend;
pub mod error;
pub mod poll;
pub mod resolve;
pub mod session;
pub mod submit;

pub use backend::{ArtifactListing, HttpBackend, JobBackend, SubmitReceipt};
pub use error::EngineError;
pub use poll::{PollConfig, PollLoop, PollPhase, Sleeper, ThreadSleeper, Transition};
pub use resolve::{ResolvedResults, ResultSource, ARTIFACT_RETRY_DELAY};
pub use session::{GenerationSession, SessionToken};
pub use submit::SubmitRequest;
