//! Data models for the agent loop: parsed status records, analysis results,
//! and the persisted session/circuit state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Agent-reported loop state from the `STATUS:` line of a status block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    InProgress,
    Complete,
    Blocked,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::InProgress => write!(f, "in_progress"),
            LoopState::Complete => write!(f, "complete"),
            LoopState::Blocked => write!(f, "blocked"),
        }
    }
}

/// Agent-reported test outcome for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestsStatus {
    Passing,
    Failing,
    NotRun,
}

/// Kind of work the agent says it did this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Implementation,
    Testing,
    Documentation,
    Refactoring,
}

/// Structured progress record extracted from one agent response.
///
/// Produced by the status parser from the fenced `---LOOP_STATUS---` block;
/// `completion_indicators` is filled in afterwards by the output analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub state: LoopState,
    pub tasks_completed: u32,
    pub files_modified: u32,
    pub tests_status: Option<TestsStatus>,
    pub work_type: Option<WorkType>,
    pub exit_signal: bool,
    pub recommendation: String,
    pub completion_indicators: u32,
}

impl Status {
    /// True when the agent reported concrete work this iteration.
    pub fn has_progress(&self) -> bool {
        self.tasks_completed > 0 || self.files_modified > 0
    }

    pub fn is_blocked(&self) -> bool {
        self.state == LoopState::Blocked
    }

    /// True when the iteration did test work and nothing else.
    pub fn is_test_only(&self) -> bool {
        self.work_type == Some(WorkType::Testing)
    }

    /// Lenient completion: either the status line or the exit signal.
    pub fn is_complete(&self) -> bool {
        self.state == LoopState::Complete || self.exit_signal
    }

    /// Strict completion: exit signal plus at least `threshold` completion
    /// phrases in the surrounding text. A non-positive threshold falls back
    /// to the default of 2.
    pub fn is_complete_strict(&self, threshold: i32) -> bool {
        let threshold = if threshold <= 0 {
            crate::circuit::DEFAULT_COMPLETION_THRESHOLD as i32
        } else {
            threshold
        };
        self.exit_signal && self.completion_indicators >= threshold as u32
    }
}

/// Output of the analyzer over one iteration's accumulated text.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub status: Option<Status>,
    pub rate_limit_hit: bool,
    /// 16 hex chars, or empty when the text contained no error lines.
    pub error_signature: String,
    pub output_size: usize,
    pub completion_count: u32,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// Terminal disposition of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted rate limiter state embedded in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub calls: i64,
    pub window_start: DateTime<Utc>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            calls: 0,
            window_start: Utc::now(),
        }
    }
}

/// Persistent per-(project, agent) record of a loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub agent: String,
    pub work_dir: PathBuf,
    pub initial_prompt: String,
    pub status: SessionStatus,
    pub loops_completed: u32,
    pub total_tasks_completed: u32,
    pub total_files_modified: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rate_limit: RateLimitState,
}

impl Session {
    /// Create a new running session for a (project, agent) key.
    pub fn new(project: &str, agent: &str, work_dir: &std::path::Path, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.to_string(),
            agent: agent.to_string(),
            work_dir: work_dir.to_path_buf(),
            initial_prompt: prompt.to_string(),
            status: SessionStatus::Running,
            loops_completed: 0,
            total_tasks_completed: 0,
            total_files_modified: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
            rate_limit: RateLimitState::default(),
        }
    }

    /// Fold one iteration's status into the aggregate counters.
    pub fn record_loop(&mut self, status: Option<&Status>) {
        self.loops_completed += 1;
        if let Some(s) = status {
            self.total_tasks_completed += s.tasks_completed;
            self.total_files_modified += s.files_modified;
        }
        self.updated_at = Utc::now();
    }
}

/// Persistent projection of the circuit breaker for a (project, agent) key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub tripped: bool,
    #[serde(default)]
    pub trip_reason: String,
    #[serde(default)]
    pub no_progress_count: u32,
    pub tripped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            tripped: false,
            trip_reason: String::new(),
            no_progress_count: 0,
            tripped_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// One entry in the bounded per-session history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub loop_count: u32,
    pub status: String,
    pub error: Option<String>,
}

/// One entry in the bounded per-circuit history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
    pub no_progress_count: u32,
    pub same_error_count: u32,
    pub test_loop_count: u32,
    pub completion_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_progress_predicate() {
        let mut status = Status::default();
        assert!(!status.has_progress());
        status.files_modified = 1;
        assert!(status.has_progress());
        status.files_modified = 0;
        status.tasks_completed = 2;
        assert!(status.has_progress());
    }

    #[test]
    fn status_completion_predicates() {
        let mut status = Status {
            state: LoopState::Complete,
            ..Default::default()
        };
        assert!(status.is_complete());

        status.state = LoopState::InProgress;
        assert!(!status.is_complete());
        status.exit_signal = true;
        assert!(status.is_complete());

        // Strict form also needs the phrase count.
        assert!(!status.is_complete_strict(2));
        status.completion_indicators = 2;
        assert!(status.is_complete_strict(2));

        // Non-positive threshold falls back to the default of 2.
        status.completion_indicators = 1;
        assert!(!status.is_complete_strict(0));
        status.completion_indicators = 2;
        assert!(status.is_complete_strict(-1));
    }

    #[test]
    fn session_aggregates_fold_in_loop_results() {
        let mut session = Session::new("proj", "agent", std::path::Path::new("/tmp/w"), "do it");
        let status = Status {
            tasks_completed: 3,
            files_modified: 2,
            ..Default::default()
        };
        session.record_loop(Some(&status));
        session.record_loop(None);

        assert_eq!(session.loops_completed, 2);
        assert_eq!(session.total_tasks_completed, 3);
        assert_eq!(session.total_files_modified, 2);
    }
}
