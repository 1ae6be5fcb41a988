pub mod artifacts;
pub mod classify;
pub mod config;
pub mod events;
pub mod markers;
pub mod report;
pub mod resume;
pub mod types;

pub use classify::{classify, classify_aggregate, ArtifactCheck, FinalizeFacts, ProcessVerdict};
pub use config::Config;
pub use markers::{Effect, Marker, MarkerTable, Matcher, ParseState};
pub use report::{concatenate_results, ConcatSummary, SubJobFile};
pub use resume::{ResumePoint, ResumeScanner};
pub use types::*;
