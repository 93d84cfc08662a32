//! Phase orchestration engine for Skill Factory.
//!
//! Runs the six build phases (baseline, audit, extract, deduplicate, verify,
//! build) against a durable checkpoint, pausing after deduplication when
//! contradictions need a human decision.

pub mod artifacts;
pub mod atoms;
pub mod checkpoint;
pub mod conflict;
pub mod dedup;
pub mod events;
pub mod evidence;
pub mod packager;
pub mod phases;
pub mod pipeline;
pub mod prompts;
pub mod sampling;
pub mod scoring;
pub mod taxonomy;
pub mod text;

#[cfg(test)]
mod testing;

pub use events::{JsonLinesReporter, PipelineEvent, PipelineReporter, SilentReporter};
pub use packager::{DirectoryPackager, Packager};
pub use pipeline::{Pipeline, RunOutcome};
