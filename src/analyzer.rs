//! Output analyzer: composes the status parser with completion-phrase
//! counting, rate-limit detection, and error-signature extraction.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::AnalysisResult;
use crate::status::parse_status;
use crate::stream::ResultEvent;

/// Completion phrases counted case-insensitively across the iteration text.
const COMPLETION_PHRASES: &[&str] = &[
    "all tasks complete",
    "project ready",
    "work is done",
    "implementation complete",
    "no more work",
    "finished",
    "task complete",
    "all done",
    "nothing left to do",
    "completed successfully",
];

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|usage.?limit|5.?hour|too.?many.?requests|quota.?exceeded|api.?limit")
        .expect("rate limit regex")
});

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(error|exception|failed|failure|cannot|unable|refused|denied|timeout|crash)[\s:]+([^\n]{0,100})",
    )
    .expect("error line regex")
});

// Volatile substrings stripped before hashing so that the same failure
// produces the same signature across runs.
static LINE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\bline\s+\d+|:\d+(?::\d+)?)").expect("line number regex"));
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t T]?(?:\d{2}:\d{2}:\d{2}(?:\.\d+)?z?)?|\d{2}:\d{2}:\d{2}")
        .expect("timestamp regex")
});
static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex address regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Maximum number of error excerpts folded into a signature.
const MAX_SIGNATURE_ERRORS: usize = 5;

/// Count completion-phrase occurrences in `text`, case-insensitively.
pub fn count_completion_phrases(text: &str) -> u32 {
    let lower = text.to_lowercase();
    COMPLETION_PHRASES
        .iter()
        .map(|phrase| lower.matches(phrase).count() as u32)
        .sum()
}

/// True when the text carries any of the known rate-limit markers.
pub fn detect_rate_limit(text: &str) -> bool {
    RATE_LIMIT_RE.is_match(text)
}

/// Hash the text's error lines into a short stable signature.
///
/// Up to five (kind, normalized message) pairs are extracted; line numbers,
/// timestamps, and hex addresses are stripped so the signature is invariant
/// to incidental churn between runs. Returns 16 hex chars, or an empty
/// string when the text contains no error lines.
pub fn error_signature(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut parts = Vec::new();
    for caps in ERROR_LINE_RE.captures_iter(text).take(MAX_SIGNATURE_ERRORS) {
        let kind = caps[1].to_lowercase();
        let message = normalize_error_message(&caps[2]);
        parts.push(format!("{}:{}", kind, message));
    }
    if parts.is_empty() {
        return String::new();
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    hex::encode(&digest[..8])
}

fn normalize_error_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    // Timestamps first: the line-number pattern would otherwise chew the
    // tail off an HH:MM:SS stamp.
    let stripped = TIMESTAMP_RE.replace_all(&lowered, "");
    let stripped = HEX_ADDR_RE.replace_all(&stripped, "");
    let stripped = LINE_NUMBER_RE.replace_all(&stripped, "");
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Analyze one iteration's accumulated text.
pub fn analyze_output(text: &str) -> AnalysisResult {
    let completion_count = count_completion_phrases(text);
    let mut status = parse_status(text);
    if let Some(ref mut s) = status {
        s.completion_indicators = completion_count;
    }

    AnalysisResult {
        status,
        rate_limit_hit: detect_rate_limit(text),
        error_signature: error_signature(text),
        output_size: text.len(),
        completion_count,
        num_turns: None,
        total_cost_usd: None,
        duration_ms: None,
    }
}

/// Analyze one iteration's text plus the terminal result event, when the
/// stream produced one.
pub fn analyze_stream_result(text: &str, result: Option<&ResultEvent>) -> AnalysisResult {
    let mut analysis = analyze_output(text);
    if let Some(event) = result {
        if event.subtype == "error_max_budget_usd" {
            analysis.rate_limit_hit = true;
        }
        analysis.num_turns = Some(event.num_turns);
        analysis.total_cost_usd = Some(event.total_cost_usd);
        analysis.duration_ms = Some(event.duration_ms);
    }
    analysis
}
