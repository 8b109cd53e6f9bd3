use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::execute::ExecutionResult;
use crate::validate::ValidationResult;

/// One observable step of a turn. Emitted before the step takes effect, so
/// the sequence of events is a complete trace of the turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopEvent {
    /// DDL text, or `Error loading schema: ...` when loading failed.
    SchemaLoaded { ddl: String },
    IterationStarted { iteration: usize, query: String },
    #[serde(rename = "validation_result")]
    Validation {
        iteration: usize,
        result: ValidationResult,
    },
    #[serde(rename = "execution_result")]
    Execution {
        iteration: usize,
        result: ExecutionResult,
    },
    #[serde(rename = "handoff_to_corrector")]
    CorrectionRequested { iteration: usize },
    CorrectionFailed { iteration: usize, error: String },
    FinalSqlQuery { query: String },
    MaxIterationsReached {
        last_query: String,
        final_error: String,
    },
}

impl LoopEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopEvent::FinalSqlQuery { .. } | LoopEvent::MaxIterationsReached { .. }
        )
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LoopEvent);
}

/// Forward to a channel. Events sent after the receiver is gone are dropped.
impl EventSink for UnboundedSender<LoopEvent> {
    fn emit(&self, event: LoopEvent) {
        let _ = self.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<LoopEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: LoopEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
