//! Parser for the fenced `---LOOP_STATUS---` block the agent appends to
//! every response.

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::models::{LoopState, Status, TestsStatus, WorkType};

static STATUS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)---LOOP_STATUS---(.+?)---END_LOOP_STATUS---").expect("status block regex")
});

static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z_]+):\s*(.*)$").expect("status line regex"));

/// Extract a [`Status`] from agent text.
///
/// Returns `None` when no well-formed block is present; a half-open block
/// (missing its end fence) also yields `None`. When multiple blocks appear
/// the first one wins. This function never fails: malformed values inside a
/// block degrade to defaults.
pub fn parse_status(text: &str) -> Option<Status> {
    let captures = STATUS_BLOCK.captures(text)?;
    let body = captures.get(1).map(|m| m.as_str())?;

    let mut status = Status::default();

    for line in body.lines() {
        let Some(caps) = STATUS_LINE.captures(line.trim()) else {
            continue;
        };
        let key = &caps[1];
        let value = caps[2].trim();

        match key {
            "STATUS" => status.state = parse_state(value),
            "TASKS_COMPLETED_THIS_LOOP" => status.tasks_completed = parse_count(key, value),
            "FILES_MODIFIED" => status.files_modified = parse_count(key, value),
            "TESTS_STATUS" => {
                status.tests_status = match value {
                    "PASSING" => Some(TestsStatus::Passing),
                    "FAILING" => Some(TestsStatus::Failing),
                    "NOT_RUN" => Some(TestsStatus::NotRun),
                    _ => None,
                }
            }
            "WORK_TYPE" => {
                status.work_type = match value {
                    "IMPLEMENTATION" => Some(WorkType::Implementation),
                    "TESTING" => Some(WorkType::Testing),
                    "DOCUMENTATION" => Some(WorkType::Documentation),
                    "REFACTORING" => Some(WorkType::Refactoring),
                    _ => None,
                }
            }
            "EXIT_SIGNAL" => status.exit_signal = value.to_lowercase() == "true",
            "RECOMMENDATION" => status.recommendation = value.to_string(),
            // Unknown keys are ignored for forward compatibility.
            _ => {}
        }
    }

    Some(status)
}

fn parse_state(value: &str) -> LoopState {
    match value {
        "COMPLETE" => LoopState::Complete,
        "BLOCKED" => LoopState::Blocked,
        "IN_PROGRESS" => LoopState::InProgress,
        other => {
            debug!("unrecognized STATUS value {:?}, treating as in-progress", other);
            LoopState::InProgress
        }
    }
}

fn parse_count(key: &str, value: &str) -> u32 {
    value.parse().unwrap_or_else(|_| {
        debug!("unparseable integer for {}: {:?}, defaulting to 0", key, value);
        0
    })
}
