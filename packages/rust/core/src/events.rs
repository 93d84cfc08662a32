//! Structured pipeline events and the reporter interface phases emit through.
//!
//! Every event serializes to a single JSON object with an `"event"`
//! discriminator. Consumers ignore event types they don't know.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use skillfactory_shared::{Conflict, PhaseId};

/// Phase lifecycle state as seen by event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseEventStatus {
    Running,
    Done,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Quality payload: a single phase's score or the final aggregate report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QualityEvent {
    Phase {
        phase: PhaseId,
        score: f64,
        pass: bool,
        atoms_count: usize,
    },
    Report {
        quality_score: f64,
        atoms_extracted: usize,
        atoms_deduplicated: usize,
        atoms_verified: usize,
        compression_ratio: f64,
    },
}

/// A single line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Phase {
        phase: PhaseId,
        name: String,
        status: PhaseEventStatus,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        level: LogLevel,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<PhaseId>,
        message: String,
    },
    Cost {
        api_cost_usd: f64,
        tokens_used: u64,
    },
    Quality(QualityEvent),
    Conflict {
        conflicts: Vec<Conflict>,
        count: usize,
    },
    Package {
        path: String,
        output_dir: String,
    },
}

/// Sink for pipeline events. Passed explicitly to every phase.
pub trait PipelineReporter: Send + Sync {
    fn emit(&self, event: PipelineEvent);

    fn phase(&self, phase: PhaseId, status: PhaseEventStatus, progress: u8, message: Option<String>) {
        self.emit(PipelineEvent::Phase {
            phase,
            name: phase.name().to_string(),
            status,
            progress: progress.min(100),
            message,
        });
    }

    fn log(&self, level: LogLevel, phase: Option<PhaseId>, message: &str) {
        self.emit(PipelineEvent::Log {
            level,
            phase,
            message: message.to_string(),
        });
    }

    fn cost(&self, api_cost_usd: f64, tokens_used: u64) {
        self.emit(PipelineEvent::Cost {
            api_cost_usd,
            tokens_used,
        });
    }
}

/// Drops every event.
pub struct SilentReporter;

impl PipelineReporter for SilentReporter {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Writes one JSON object per line.
pub struct JsonLinesReporter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> PipelineReporter for JsonLinesReporter<W> {
    fn emit(&self, event: PipelineEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
            tracing::debug!("event sink closed");
        }
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<PipelineEvent>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl PipelineReporter for RecordingReporter {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
