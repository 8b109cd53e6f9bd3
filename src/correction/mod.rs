//! The bounded validate / execute / correct state machine that drives one
//! turn.
//!
//! A turn starts from a fresh [`LoopState`] holding the caller's candidate
//! query. Each iteration validates the candidate, executes it only if
//! validation passed, and on failure hands the accumulated feedback to a
//! [`Corrector`] for a new candidate. The turn ends in exactly one of two
//! terminal phases, each announced by exactly one terminal [`LoopEvent`].
mod events;

pub use events::{EventLog, EventSink, LoopEvent};

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::candidate::clean_sql_query;
use crate::config::DEFAULT_MAX_ITERATIONS;
use crate::execute::{ExecutionResult, SKIPPED_AFTER_VALIDATION};
use crate::rows::RowSet;
use crate::validate::ValidationResult;

pub const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Execute,
    Correct,
    Succeeded,
    Exhausted,
}

/// Everything a turn knows. Owned by the loop for the duration of the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub question: String,
    pub candidate: String,
    pub validation: Option<ValidationResult>,
    pub execution: Option<ExecutionResult>,
    /// 1-based number of the iteration in progress.
    pub iteration: usize,
    pub final_query: Option<String>,
}

impl LoopState {
    pub fn new(question: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            candidate: candidate.into(),
            validation: None,
            execution: None,
            iteration: 1,
            final_query: None,
        }
    }

    /// Most recent concrete error: the execution error if there is one,
    /// otherwise the validation errors behind a skipped execution.
    pub fn last_error(&self) -> String {
        if let Some(message) = self.execution.as_ref().and_then(|e| e.error_message()) {
            return message.to_string();
        }
        self.validation
            .as_ref()
            .and_then(ValidationResult::summary)
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string())
    }
}

/// Validation and execution as seen by the loop. Both report failures as
/// values.
pub trait QueryProcessor: Send + Sync {
    fn validate(&self, query: &str) -> ValidationResult;

    fn execute(&self, query: &str) -> impl Future<Output = Result<RowSet, String>> + Send;
}

/// Feedback handed to the corrector after a failed iteration.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionRequest<'a> {
    pub question: &'a str,
    pub query: &'a str,
    pub schema_ddl: &'a str,
    pub validation: Option<&'a ValidationResult>,
    pub execution: Option<&'a ExecutionResult>,
}

/// Produces a revised candidate from failure feedback.
pub trait Corrector: Send + Sync {
    fn correct(
        &self,
        request: CorrectionRequest<'_>,
    ) -> impl Future<Output = Result<String, String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Succeeded {
        final_query: String,
        rows: RowSet,
        iterations: usize,
    },
    Exhausted {
        last_query: String,
        final_error: String,
        iterations: usize,
    },
}

impl TurnOutcome {
    pub fn final_query(&self) -> Option<&str> {
        match self {
            TurnOutcome::Succeeded { final_query, .. } => Some(final_query),
            TurnOutcome::Exhausted { .. } => None,
        }
    }

    pub fn iterations(&self) -> usize {
        match self {
            TurnOutcome::Succeeded { iterations, .. } | TurnOutcome::Exhausted { iterations, .. } => {
                *iterations
            }
        }
    }
}

pub struct CorrectionLoop<'a, P, C, S> {
    processor: &'a P,
    corrector: &'a C,
    sink: &'a S,
    max_iterations: usize,
    correction_timeout: Option<Duration>,
}

impl<'a, P, C, S> CorrectionLoop<'a, P, C, S>
where
    P: QueryProcessor,
    C: Corrector,
    S: EventSink,
{
    pub fn new(processor: &'a P, corrector: &'a C, sink: &'a S) -> Self {
        Self {
            processor,
            corrector,
            sink,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            correction_timeout: None,
        }
    }

    /// Values below 1 are treated as 1.
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn correction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.correction_timeout = timeout;
        self
    }

    /// Run one turn to completion.
    pub async fn run(&self, question: &str, candidate: &str, schema_ddl: &str) -> TurnOutcome {
        let mut state = LoopState::new(question, candidate);
        self.start_iteration(&state);

        let mut phase = Phase::Validate;
        loop {
            phase = match phase {
                Phase::Validate => self.validate(&mut state),
                Phase::Execute => self.execute(&mut state).await,
                Phase::Correct => self.correct(&mut state, schema_ddl).await,
                Phase::Succeeded => return self.succeed(state),
                Phase::Exhausted => return self.exhaust(state),
            };
        }
    }

    fn start_iteration(&self, state: &LoopState) {
        info!(
            iteration = state.iteration,
            max = self.max_iterations,
            query = %state.candidate,
            "starting correction iteration"
        );
        self.sink.emit(LoopEvent::IterationStarted {
            iteration: state.iteration,
            query: state.candidate.clone(),
        });
    }

    fn validate(&self, state: &mut LoopState) -> Phase {
        let result = self.processor.validate(&state.candidate);
        self.sink.emit(LoopEvent::Validation {
            iteration: state.iteration,
            result: result.clone(),
        });

        let next = if result.is_success() {
            Phase::Execute
        } else {
            let skipped = ExecutionResult::skipped(SKIPPED_AFTER_VALIDATION);
            self.sink.emit(LoopEvent::Execution {
                iteration: state.iteration,
                result: skipped.clone(),
            });
            state.execution = Some(skipped);
            Phase::Correct
        };
        state.validation = Some(result);
        next
    }

    async fn execute(&self, state: &mut LoopState) -> Phase {
        let result = ExecutionResult::from(self.processor.execute(&state.candidate).await);
        self.sink.emit(LoopEvent::Execution {
            iteration: state.iteration,
            result: result.clone(),
        });

        let next = if result.is_success() {
            Phase::Succeeded
        } else {
            Phase::Correct
        };
        state.execution = Some(result);
        next
    }

    async fn correct(&self, state: &mut LoopState, schema_ddl: &str) -> Phase {
        if state.iteration >= self.max_iterations {
            return Phase::Exhausted;
        }

        info!(iteration = state.iteration, "handing off to corrector");
        self.sink.emit(LoopEvent::CorrectionRequested {
            iteration: state.iteration,
        });

        let request = CorrectionRequest {
            question: &state.question,
            query: &state.candidate,
            schema_ddl,
            validation: state.validation.as_ref(),
            execution: state.execution.as_ref(),
        };
        let corrected = match self.correction_timeout {
            Some(limit) => tokio::time::timeout(limit, self.corrector.correct(request))
                .await
                .unwrap_or_else(|_| {
                    Err(format!("corrector timed out after {}s", limit.as_secs_f64()))
                }),
            None => self.corrector.correct(request).await,
        };

        // A failed correction keeps the current candidate; the iteration
        // still counts toward the bound.
        match corrected {
            Ok(query) => state.candidate = clean_sql_query(&query),
            Err(error) => {
                warn!(iteration = state.iteration, error = %error, "corrector failed");
                self.sink.emit(LoopEvent::CorrectionFailed {
                    iteration: state.iteration,
                    error,
                });
            }
        }

        state.iteration += 1;
        self.start_iteration(state);
        Phase::Validate
    }

    fn succeed(&self, mut state: LoopState) -> TurnOutcome {
        let final_query = state.candidate.clone();
        state.final_query = Some(final_query.clone());
        info!(iteration = state.iteration, query = %final_query, "query succeeded");
        self.sink.emit(LoopEvent::FinalSqlQuery {
            query: final_query.clone(),
        });

        let rows = match state.execution {
            Some(ExecutionResult::Success { rows }) => rows,
            _ => RowSet::default(),
        };
        TurnOutcome::Succeeded {
            final_query,
            rows,
            iterations: state.iteration,
        }
    }

    fn exhaust(&self, state: LoopState) -> TurnOutcome {
        let final_error = state.last_error();
        warn!(
            iterations = state.iteration,
            error = %final_error,
            "max iterations reached without a successful query"
        );
        self.sink.emit(LoopEvent::MaxIterationsReached {
            last_query: state.candidate.clone(),
            final_error: final_error.clone(),
        });
        TurnOutcome::Exhausted {
            last_query: state.candidate,
            final_error,
            iterations: state.iteration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Validation and execution verdicts keyed by query text.
    struct Scripted {
        invalid: Vec<(&'static str, &'static str)>,
        failing: Vec<(&'static str, &'static str)>,
        executed: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                invalid: Vec::new(),
                failing: Vec::new(),
                executed: Mutex::new(Vec::new()),
            }
        }

        fn invalid(mut self, query: &'static str, error: &'static str) -> Self {
            self.invalid.push((query, error));
            self
        }

        fn failing(mut self, query: &'static str, error: &'static str) -> Self {
            self.failing.push((query, error));
            self
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl QueryProcessor for Scripted {
        fn validate(&self, query: &str) -> ValidationResult {
            match self.invalid.iter().find(|(q, _)| *q == query) {
                Some((_, error)) => ValidationResult::error(*error),
                None => ValidationResult::Success,
            }
        }

        async fn execute(&self, query: &str) -> Result<RowSet, String> {
            self.executed.lock().unwrap().push(query.to_string());
            match self.failing.iter().find(|(q, _)| *q == query) {
                Some((_, error)) => Err(error.to_string()),
                None => Ok(RowSet {
                    columns: vec!["n".into()],
                    ..RowSet::default()
                }),
            }
        }
    }

    /// Replays a fixed list of answers.
    struct Replay {
        answers: Mutex<VecDeque<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl Replay {
        fn new(answers: Vec<Result<&str, &str>>) -> Self {
            Self {
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .map(|a| a.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Corrector for Replay {
        async fn correct(&self, _request: CorrectionRequest<'_>) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("no more answers".to_string()))
        }
    }

    fn kinds(events: &[LoopEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                LoopEvent::SchemaLoaded { .. } => "schema",
                LoopEvent::IterationStarted { .. } => "start",
                LoopEvent::Validation { result, .. } if result.is_success() => "valid",
                LoopEvent::Validation { .. } => "invalid",
                LoopEvent::Execution { result, .. } => match result {
                    ExecutionResult::Success { .. } => "ok",
                    ExecutionResult::Error { .. } => "failed",
                    ExecutionResult::Skipped { .. } => "skipped",
                },
                LoopEvent::CorrectionRequested { .. } => "handoff",
                LoopEvent::CorrectionFailed { .. } => "correction_failed",
                LoopEvent::FinalSqlQuery { .. } => "final",
                LoopEvent::MaxIterationsReached { .. } => "exhausted",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_candidate_succeeds() {
        let processor = Scripted::new();
        let corrector = Replay::new(vec![]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .run("how many customers?", "SELECT COUNT(*) FROM customer;", "")
            .await;

        assert_eq!(outcome.final_query(), Some("SELECT COUNT(*) FROM customer;"));
        assert_eq!(outcome.iterations(), 1);
        assert_eq!(corrector.calls(), 0);
        assert_eq!(kinds(&log.events()), vec!["start", "valid", "ok", "final"]);
    }

    #[tokio::test]
    async fn test_correction_after_validation_error() {
        let processor = Scripted::new().invalid(
            "SELECT last_name FROM customer;",
            "Column 'last_name' could not be resolved",
        );
        let corrector = Replay::new(vec![Ok("```sql\nSELECT name FROM customer\n```")]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .run("names?", "SELECT last_name FROM customer;", "")
            .await;

        assert_eq!(outcome.final_query(), Some("SELECT name FROM customer;"));
        assert_eq!(outcome.iterations(), 2);
        assert_eq!(processor.executed(), vec!["SELECT name FROM customer;"]);
        assert_eq!(
            kinds(&log.events()),
            vec!["start", "invalid", "skipped", "handoff", "start", "valid", "ok", "final"]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_execution_error() {
        let processor = Scripted::new()
            .failing("SELECT * FROM orders;", "no such table: orders")
            .failing("SELECT id FROM orders;", "no such table: orders");
        let corrector = Replay::new(vec![Ok("SELECT id FROM orders;"), Ok("SELECT * FROM orders;")]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .run("orders?", "SELECT * FROM orders;", "")
            .await;

        assert_eq!(
            outcome,
            TurnOutcome::Exhausted {
                last_query: "SELECT * FROM orders;".into(),
                final_error: "no such table: orders".into(),
                iterations: 3,
            }
        );
        assert_eq!(processor.executed().len(), 3);
        assert_eq!(corrector.calls(), 2);
        let events = log.events();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(!events.iter().any(|e| matches!(e, LoopEvent::FinalSqlQuery { .. })));
    }

    #[tokio::test]
    async fn test_invalid_query_is_never_executed() {
        let processor = Scripted::new().invalid("SELEC 1;", "syntax error");
        let corrector = Replay::new(vec![Ok("SELEC 1"), Ok("SELEC 1;"), Ok(" SELEC 1 ")]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .max_iterations(4)
            .run("", "SELEC 1;", "")
            .await;

        assert!(processor.executed().is_empty());
        assert_eq!(outcome.iterations(), 4);
        match outcome {
            TurnOutcome::Exhausted { final_error, .. } => assert_eq!(final_error, "syntax error"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrector_failure_keeps_candidate() {
        let processor = Scripted::new().failing("SELECT 1", "boom");
        let corrector = Replay::new(vec![Err("model unavailable")]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .max_iterations(2)
            .run("", "SELECT 1", "")
            .await;

        assert_eq!(processor.executed(), vec!["SELECT 1", "SELECT 1"]);
        assert_eq!(outcome.iterations(), 2);
        assert!(log
            .events()
            .iter()
            .any(|e| matches!(e, LoopEvent::CorrectionFailed { error, .. } if error == "model unavailable")));
    }

    #[tokio::test]
    async fn test_single_iteration_never_calls_corrector() {
        let processor = Scripted::new().failing("SELECT 1", "boom");
        let corrector = Replay::new(vec![Ok("SELECT 2")]);
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &corrector, &log)
            .max_iterations(0)
            .run("", "SELECT 1", "")
            .await;

        assert_eq!(corrector.calls(), 0);
        assert_eq!(outcome.iterations(), 1);
        assert_eq!(kinds(&log.events()), vec!["start", "valid", "failed", "exhausted"]);
    }

    struct Stalled;

    impl Corrector for Stalled {
        async fn correct(&self, _request: CorrectionRequest<'_>) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_correction_timeout() {
        let processor = Scripted::new().failing("SELECT 1", "boom");
        let log = EventLog::new();
        let outcome = CorrectionLoop::new(&processor, &Stalled, &log)
            .max_iterations(2)
            .correction_timeout(Some(Duration::from_millis(50)))
            .run("", "SELECT 1", "")
            .await;

        assert_eq!(outcome.iterations(), 2);
        assert!(log.events().iter().any(|e| matches!(
            e,
            LoopEvent::CorrectionFailed { error, .. } if error.contains("timed out")
        )));
    }

    #[test]
    fn test_last_error_fallbacks() {
        let mut state = LoopState::new("", "SELECT 1");
        assert_eq!(state.last_error(), UNKNOWN_ERROR);
        state.validation = Some(ValidationResult::error("bad column"));
        state.execution = Some(ExecutionResult::skipped(SKIPPED_AFTER_VALIDATION));
        assert_eq!(state.last_error(), "bad column");
        state.execution = Some(ExecutionResult::Error {
            error_message: "no such table: orders".into(),
        });
        assert_eq!(state.last_error(), "no such table: orders");
    }
}
