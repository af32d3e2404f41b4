//! NDJSON stream parser for the agent harness protocol.
//!
//! A run's stdout starts with plain-text init lines prefixed `[clawker] `;
//! exactly one `[clawker] ready` line marks the hand-off to NDJSON. After
//! that, every meaningful line is a JSON object with a `type` field, and the
//! stream terminates on a `result` event.

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix for plain-text init lines emitted before the NDJSON phase.
pub const INIT_PREFIX: &str = "[clawker] ";
/// Init line that gates the NDJSON phase.
pub const READY_MARKER: &str = "[clawker] ready";
/// Init line reporting a fatal harness error.
pub const ERROR_MARKER: &str = "[clawker] error";

/// Initial line buffer capacity.
const INITIAL_BUF_BYTES: usize = 64 * 1024;
/// Hard cap on a single stream line.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("agent init failed: {0}")]
    Init(String),
    #[error("stream ended before ready signal")]
    EndedBeforeReady,
    #[error("stream ended without a result event")]
    MissingResult,
    #[error("stream line exceeds {MAX_LINE_BYTES} bytes")]
    OversizeLine,
    #[error("malformed result event: {0}")]
    MalformedResult(#[source] serde_json::Error),
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream parsing cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Token usage reported inside messages and results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
}

/// Metadata attached to a `compact_boundary` system event.
#[derive(Debug, Clone, Deserialize)]
pub struct CompactMetadata {
    pub trigger: String,
    #[serde(default)]
    pub pre_tokens: u64,
}

/// `type: system` — harness lifecycle notices (`init`, `compact_boundary`).
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: String,
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub cwd: Option<String>,
    #[serde(rename = "permissionMode")]
    pub permission_mode: Option<String>,
    pub compact_metadata: Option<CompactMetadata>,
}

/// Content of a `tool_result` block: either a bare string or a list of
/// text blocks. Both shapes appear on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultBlock {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
}

/// One block of message content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
    /// Unknown block kinds are tolerated for forward compatibility.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub id: Option<String>,
    pub role: String,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub usage: Option<TokenUsage>,
}

/// `type: assistant` — one assistant turn.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub session_id: String,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// `type: user` — tool results echoed back as user turns.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub session_id: String,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    pub message: UserMessage,
}

/// Incremental delta payload inside a `stream_event`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub partial_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub index: Option<u32>,
    pub content_block: Option<serde_json::Value>,
    pub delta: Option<StreamDelta>,
    pub message: Option<serde_json::Value>,
    pub usage: Option<serde_json::Value>,
}

/// `type: stream_event` — raw API stream passthrough.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamDeltaEvent {
    pub session_id: String,
    pub event: StreamEventPayload,
}

/// `type: result` — terminal event; exactly one per stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    pub session_id: String,
    pub is_error: bool,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Receives typed events in line order. All methods default to no-ops so
/// implementors override only what they need.
pub trait EventHandler: Send {
    fn on_system(&mut self, _event: &SystemEvent) {}
    fn on_assistant(&mut self, _event: &AssistantEvent) {}
    fn on_user(&mut self, _event: &UserEvent) {}
    fn on_stream_event(&mut self, _event: &StreamDeltaEvent) {}
    fn on_result(&mut self, _event: &ResultEvent) {}
}

/// Read one line with the size cap enforced, without consuming past it.
/// Returns `None` at EOF with nothing buffered.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Option<String>, StreamError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            chunk = reader.fill_buf() => chunk?,
        };
        if chunk.is_empty() {
            // EOF: hand back a final unterminated line if any.
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }

        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&chunk[..pos]);
            reader.consume(pos + 1);
            if buf.len() > MAX_LINE_BYTES {
                return Err(StreamError::OversizeLine);
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }

        let len = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(len);
        if buf.len() > MAX_LINE_BYTES {
            return Err(StreamError::OversizeLine);
        }
    }
}

/// Parse an agent output stream, dispatching typed events to `handler`, and
/// return the terminal [`ResultEvent`].
///
/// The init phase is consumed first: lines are discarded until the ready
/// marker, an `[clawker] error` line aborts, and EOF before the marker is an
/// error. Cancellation is honored between lines. After the result event no
/// further lines are consumed.
pub async fn parse_stream<R, H>(
    cancel: &CancellationToken,
    reader: R,
    handler: &mut H,
) -> Result<ResultEvent, StreamError>
where
    R: AsyncRead + Unpin,
    H: EventHandler,
{
    let mut reader = BufReader::with_capacity(INITIAL_BUF_BYTES, reader);

    // Init gate.
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let Some(line) = read_line_capped(&mut reader, cancel).await? else {
            return Err(StreamError::EndedBeforeReady);
        };
        if line.starts_with(READY_MARKER) {
            debug!("agent harness ready");
            break;
        }
        if line.starts_with(ERROR_MARKER) {
            return Err(StreamError::Init(line));
        }
        debug!("init: {}", line);
    }

    // NDJSON phase.
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let Some(line) = read_line_capped(&mut reader, cancel).await? else {
            return Err(StreamError::MissingResult);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('{') {
            debug!("skipping non-JSON stream line: {:.80}", line);
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("unparseable stream envelope, skipping line: {}", e);
                continue;
            }
        };

        match envelope.kind.as_str() {
            "system" => match serde_json::from_str::<SystemEvent>(line) {
                Ok(event) => handler.on_system(&event),
                Err(e) => warn!("bad system event, skipping: {}", e),
            },
            "assistant" => match serde_json::from_str::<AssistantEvent>(line) {
                Ok(event) => handler.on_assistant(&event),
                Err(e) => warn!("bad assistant event, skipping: {}", e),
            },
            "user" => match serde_json::from_str::<UserEvent>(line) {
                Ok(event) => handler.on_user(&event),
                Err(e) => warn!("bad user event, skipping: {}", e),
            },
            "stream_event" => match serde_json::from_str::<StreamDeltaEvent>(line) {
                Ok(event) => handler.on_stream_event(&event),
                Err(e) => warn!("bad stream_event, skipping: {}", e),
            },
            "result" => {
                // Corruption of the terminal event is fatal: the caller
                // cannot reason about the iteration without it.
                let event: ResultEvent =
                    serde_json::from_str(line).map_err(StreamError::MalformedResult)?;
                handler.on_result(&event);
                return Ok(event);
            }
            other => {
                debug!("ignoring unknown event type {:?}", other);
            }
        }
    }
}

/// Handler that gathers assistant text for the output analyzer.
///
/// Text blocks are joined with newlines; tool-use blocks are counted.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    tool_use_count: u32,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn tool_use_count(&self) -> u32 {
        self.tool_use_count
    }

    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }
}

impl EventHandler for TextAccumulator {
    fn on_assistant(&mut self, event: &AssistantEvent) {
        for block in &event.message.content {
            match block {
                ContentBlock::Text { text } => self.push_text(text),
                ContentBlock::ToolUse { .. } => self.tool_use_count += 1,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const READY: &str = "[clawker] ready\n";

    fn result_line(subtype: &str) -> String {
        format!(
            concat!(
                r#"{{"type":"result","subtype":"{}","session_id":"s1","is_error":false,"#,
                r#""duration_ms":1500,"duration_api_ms":1200,"num_turns":4,"total_cost_usd":0.05,"#,
                r#""result":"done"}}"#,
                "\n"
            ),
            subtype
        )
    }

    fn assistant_line(text: &str) -> String {
        format!(
            concat!(
                r#"{{"type":"assistant","session_id":"s1","parent_tool_use_id":null,"#,
                r#""message":{{"id":"m1","role":"assistant","model":"claude","stop_reason":"end_turn","#,
                r#""content":[{{"type":"text","text":"{}"}}]}}}}"#,
                "\n"
            ),
            text
        )
    }

    async fn parse(input: String) -> Result<(TextAccumulator, ResultEvent), StreamError> {
        let cancel = CancellationToken::new();
        let mut accumulator = TextAccumulator::new();
        let result = parse_stream(&cancel, Cursor::new(input.into_bytes()), &mut accumulator).await?;
        Ok((accumulator, result))
    }

    #[tokio::test]
    async fn round_trips_a_minimal_stream() {
        let input = format!("{}{}", READY, result_line("success"));
        let (_, result) = parse(input).await.expect("parse");
        assert_eq!(result.subtype, "success");
        assert_eq!(result.num_turns, 4);
        assert_eq!(result.duration_ms, 1500);
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn accumulates_assistant_text_and_tool_uses() {
        let tool_line = concat!(
            r#"{"type":"assistant","session_id":"s1","message":{"id":"m2","role":"assistant","#,
            r#""model":"claude","stop_reason":null,"content":[{"type":"tool_use","id":"t1","#,
            r#""name":"bash","input":{"command":"ls"}},{"type":"text","text":"second"}]}}"#,
            "\n"
        );
        let input = format!(
            "{}{}{}{}",
            READY,
            assistant_line("first"),
            tool_line,
            result_line("success")
        );
        let (accumulator, _) = parse(input).await.expect("parse");
        assert_eq!(accumulator.text(), "first\nsecond");
        assert_eq!(accumulator.tool_use_count(), 1);
    }

    #[tokio::test]
    async fn init_lines_before_ready_are_discarded() {
        let input = format!(
            "[clawker] starting container\n[clawker] agent config injected\n{}{}",
            READY,
            result_line("success")
        );
        let (_, result) = parse(input).await.expect("parse");
        assert_eq!(result.subtype, "success");
    }

    #[tokio::test]
    async fn init_error_line_aborts() {
        let input = "[clawker] error: credentials missing\n".to_string();
        let err = parse(input).await.expect_err("should fail");
        match err {
            StreamError::Init(line) => assert!(line.contains("credentials missing")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_before_ready_errors() {
        let err = parse("[clawker] starting\n".to_string())
            .await
            .expect_err("should fail");
        assert!(matches!(err, StreamError::EndedBeforeReady));
    }

    #[tokio::test]
    async fn eof_without_result_errors() {
        let input = format!("{}{}", READY, assistant_line("some text"));
        let err = parse(input).await.expect_err("should fail");
        assert!(matches!(err, StreamError::MissingResult));
    }

    #[tokio::test]
    async fn malformed_non_terminal_events_are_skipped() {
        // assistant event with a wrong-typed message field, then a clean result.
        let bad = "{\"type\":\"assistant\",\"session_id\":\"s1\",\"message\":42}\n";
        let input = format!("{}{}{}", READY, bad, result_line("success"));
        let (_, result) = parse(input).await.expect("parse");
        assert_eq!(result.subtype, "success");
    }

    #[tokio::test]
    async fn malformed_result_event_is_fatal() {
        let bad = "{\"type\":\"result\",\"subtype\":\"success\"}\n";
        let input = format!("{}{}", READY, bad);
        let err = parse(input).await.expect_err("should fail");
        assert!(matches!(err, StreamError::MalformedResult(_)));
    }

    #[tokio::test]
    async fn unknown_event_types_and_extra_fields_are_tolerated() {
        let unknown = "{\"type\":\"telemetry\",\"whatever\":1}\n";
        let system = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"claude","#,
            r#""tools":["bash"],"cwd":"/work","permissionMode":"default","#,
            r#""brand_new_field":{"nested":true}}"#,
            "\n"
        );
        let input = format!("{}{}{}{}", READY, unknown, system, result_line("success"));

        struct CountingHandler {
            system_events: u32,
        }
        impl EventHandler for CountingHandler {
            fn on_system(&mut self, _event: &SystemEvent) {
                self.system_events += 1;
            }
        }

        let cancel = CancellationToken::new();
        let mut handler = CountingHandler { system_events: 0 };
        let result = parse_stream(&cancel, Cursor::new(input.into_bytes()), &mut handler)
            .await
            .expect("parse");
        assert_eq!(result.subtype, "success");
        assert_eq!(handler.system_events, 1);
    }

    #[tokio::test]
    async fn tool_result_content_accepts_string_and_blocks() {
        let string_form = concat!(
            r#"{"type":"user","session_id":"s1","message":{"role":"user","#,
            r#""content":[{"type":"tool_result","tool_use_id":"t1","content":"plain output"}]}}"#,
            "\n"
        );
        let block_form = concat!(
            r#"{"type":"user","session_id":"s1","message":{"role":"user","#,
            r#""content":[{"type":"tool_result","tool_use_id":"t2","#,
            r#""content":[{"type":"text","text":"block output"}],"is_error":true}]}}"#,
            "\n"
        );
        let input = format!("{}{}{}{}", READY, string_form, block_form, result_line("success"));

        struct ToolResults {
            seen: Vec<bool>,
        }
        impl EventHandler for ToolResults {
            fn on_user(&mut self, event: &UserEvent) {
                for block in &event.message.content {
                    if let ContentBlock::ToolResult { is_error, .. } = block {
                        self.seen.push(*is_error);
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut handler = ToolResults { seen: Vec::new() };
        parse_stream(&cancel, Cursor::new(input.into_bytes()), &mut handler)
            .await
            .expect("parse");
        assert_eq!(handler.seen, vec![false, true]);
    }

    #[tokio::test]
    async fn stream_delta_events_are_dispatched() {
        let delta = concat!(
            r#"{"type":"stream_event","session_id":"s1","#,
            r#""event":{"type":"content_block_delta","index":0,"#,
            r#""delta":{"type":"text_delta","text":"chunk"}}}"#,
            "\n"
        );
        let input = format!("{}{}{}", READY, delta, result_line("success"));

        struct Deltas {
            text: String,
        }
        impl EventHandler for Deltas {
            fn on_stream_event(&mut self, event: &StreamDeltaEvent) {
                if let Some(delta) = &event.event.delta {
                    if let Some(text) = &delta.text {
                        self.text.push_str(text);
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut handler = Deltas { text: String::new() };
        parse_stream(&cancel, Cursor::new(input.into_bytes()), &mut handler)
            .await
            .expect("parse");
        assert_eq!(handler.text, "chunk");
    }

    #[tokio::test]
    async fn cancellation_is_honored() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut accumulator = TextAccumulator::new();
        let input = format!("{}{}", READY, result_line("success"));
        let err = parse_stream(&cancel, Cursor::new(input.into_bytes()), &mut accumulator)
            .await
            .expect_err("should fail");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn oversize_line_errors() {
        let huge = format!("{}{}\n", READY, "x".repeat(MAX_LINE_BYTES + 1));
        let err = parse(huge).await.expect_err("should fail");
        assert!(matches!(err, StreamError::OversizeLine));
    }

    #[tokio::test]
    async fn non_json_lines_after_ready_are_skipped() {
        let input = format!(
            "{}some stray log line\n\n{}",
            READY,
            result_line("success")
        );
        let (_, result) = parse(input).await.expect("parse");
        assert_eq!(result.subtype, "success");
    }
}
