//! The loop orchestrator: owns the per-iteration sandbox lifecycle, the
//! circuit breaker and rate limiter gates, persistence checkpoints, and
//! callback fan-out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::analyze_stream_result;
use crate::circuit::{CircuitBreaker, CircuitThresholds};
use crate::models::{
    CircuitHistoryEntry, CircuitState, Session, SessionHistoryEntry, SessionStatus, Status,
};
use crate::ratelimit::RateLimiter;
use crate::sandbox::{demux_stream, BoundedBuffer, SandboxProvider, STDERR_CAPTURE_BYTES};
use crate::store::{HistoryStore, SessionStore};
use crate::stream::{
    parse_stream, AssistantEvent, EventHandler, ResultEvent, StreamDeltaEvent, TextAccumulator,
};

/// Teardown budget per sandbox, independent of the caller's cancellation.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before retrying an iteration after an in-stream rate limit hit.
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Same-error streak length that triggers the `repeated_error` history
/// entry. Deliberately a literal, decoupled from the configured trip
/// threshold.
const REPEATED_ERROR_WARNING_STREAK: u32 = 3;

/// Pipe capacity between the demultiplexer and the stream parser.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Errors surfaced through [`RunResult::error`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("context cancelled")]
    Cancelled,
    #[error("failed to load persisted state: {0}")]
    SessionLoad(#[source] anyhow::Error),
    #[error("circuit already tripped: {0}")]
    CircuitOpen(String),
    #[error("circuit breaker tripped: {0}")]
    CircuitTripped(String),
    #[error("sandbox failure: {0}")]
    Sandbox(#[source] anyhow::Error),
    #[error("stream protocol failure: {0}")]
    Stream(String),
    #[error("API rate limit exhausted")]
    RateLimitExhausted,
    #[error("reached maximum loops ({0})")]
    MaxLoops(u32),
}

/// Error produced inside one iteration.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error("sandbox failure: {0}")]
    Sandbox(#[source] anyhow::Error),
    #[error("stream protocol failure: {0}")]
    Stream(String),
    #[error("iteration timed out after {0:?}")]
    Timeout(Duration),
}

/// Observer hooks. All optional; implementations must not block.
#[derive(Default)]
pub struct Callbacks {
    pub on_loop_start: Option<Box<dyn Fn(u32) + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub on_loop_end: Option<
        Box<
            dyn Fn(u32, Option<&Status>, Option<&ResultEvent>, Option<&IterationError>)
                + Send
                + Sync,
        >,
    >,
    pub on_output: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_stream_event: Option<Box<dyn Fn(&StreamDeltaEvent) + Send + Sync>>,
    /// Return true to wait out the limit and retry the iteration.
    pub on_rate_limit_hit: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

/// Everything a run needs besides the sandbox provider and the stores.
pub struct RunOptions {
    pub project: String,
    pub agent: String,
    pub work_dir: PathBuf,
    pub prompt: String,
    pub max_loops: u32,
    pub thresholds: CircuitThresholds,
    /// Agent invocations per hour; zero or below disables the limiter.
    pub rate_limit: i64,
    pub loop_timeout: Duration,
    pub loop_delay: Duration,
    pub strict_completion: bool,
    pub reset_circuit: bool,
    pub session_ttl_hours: i64,
    pub callbacks: Callbacks,
}

impl RunOptions {
    pub fn new(project: &str, agent: &str, work_dir: &std::path::Path, prompt: &str) -> Self {
        Self {
            project: project.to_string(),
            agent: agent.to_string(),
            work_dir: work_dir.to_path_buf(),
            prompt: prompt.to_string(),
            max_loops: 10,
            thresholds: CircuitThresholds::default(),
            rate_limit: 0,
            loop_timeout: Duration::from_secs(30 * 60),
            loop_delay: Duration::from_secs(2),
            strict_completion: false,
            reset_circuit: false,
            session_ttl_hours: 24,
            callbacks: Callbacks::default(),
        }
    }
}

/// Final disposition of a run.
#[derive(Debug)]
pub struct RunResult {
    pub loops_completed: u32,
    pub exit_reason: String,
    pub error: Option<RunError>,
}

struct IterationOutcome {
    text: String,
    result: Option<ResultEvent>,
    exit_code: Option<i64>,
    error: Option<IterationError>,
}

/// Handler wired into the stream parser for one iteration: accumulates
/// assistant text and fans stream deltas out to the observer callbacks.
struct RunnerHandler {
    accumulator: TextAccumulator,
    callbacks: Arc<Callbacks>,
}

impl EventHandler for RunnerHandler {
    fn on_assistant(&mut self, event: &AssistantEvent) {
        self.accumulator.on_assistant(event);
    }

    fn on_stream_event(&mut self, event: &StreamDeltaEvent) {
        if let Some(on_output) = &self.callbacks.on_output {
            if let Some(text) = event.event.delta.as_ref().and_then(|d| d.text.as_deref()) {
                on_output(text);
            }
        }
        if let Some(on_stream_event) = &self.callbacks.on_stream_event {
            on_stream_event(event);
        }
    }
}

/// Drives the bounded autonomous loop for one (project, agent) key.
///
/// The runner exclusively owns its circuit breaker, rate limiter, and
/// session for the duration of a run; stores are single-writer-per-key by
/// this discipline.
pub struct Runner {
    provider: Arc<dyn SandboxProvider>,
    store: SessionStore,
    history: HistoryStore,
    options: RunOptions,
    callbacks: Arc<Callbacks>,
    circuit: CircuitBreaker,
    limiter: RateLimiter,
}

impl Runner {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: SessionStore,
        history: HistoryStore,
        mut options: RunOptions,
    ) -> Self {
        let callbacks = Arc::new(std::mem::take(&mut options.callbacks));
        let circuit = CircuitBreaker::new(options.thresholds);
        let limiter = RateLimiter::new(options.rate_limit);
        Self {
            provider,
            store,
            history,
            options,
            callbacks,
            circuit,
            limiter,
        }
    }

    /// Run the loop until completion, a trip, an error, cancellation, or the
    /// iteration cap.
    pub async fn run(&mut self, cancel: &CancellationToken) -> RunResult {
        let project = self.options.project.clone();
        let agent = self.options.agent.clone();

        // Both persisted records load before the first iteration; running
        // with a broken circuit is unsafe, so malformed state is fatal.
        match self.store.load_circuit_state(&project, &agent).await {
            Err(e) => {
                return RunResult {
                    loops_completed: 0,
                    exit_reason: "failed to load circuit state".to_string(),
                    error: Some(RunError::SessionLoad(e)),
                }
            }
            Ok(Some(state)) => {
                if self.options.reset_circuit {
                    info!("resetting circuit state for {}/{}", project, agent);
                    if let Err(e) = self.store.delete_circuit_state(&project, &agent).await {
                        warn!("failed to delete circuit state: {:#}", e);
                    }
                } else if state.tripped {
                    return RunResult {
                        loops_completed: 0,
                        exit_reason: format!("circuit already tripped: {}", state.trip_reason),
                        error: Some(RunError::CircuitOpen(state.trip_reason)),
                    };
                } else {
                    let mut counters = self.circuit.state();
                    counters.no_progress_count = state.no_progress_count;
                    self.circuit.restore_state(counters);
                }
            }
            Ok(None) => {}
        }

        let mut session = match self
            .store
            .load_session_with_expiration(&project, &agent, self.options.session_ttl_hours)
            .await
        {
            Err(e) => {
                return RunResult {
                    loops_completed: 0,
                    exit_reason: "failed to load session".to_string(),
                    error: Some(RunError::SessionLoad(e)),
                }
            }
            Ok((Some(existing), _)) => {
                info!(
                    "resuming session {} for {}/{} ({} loops so far)",
                    existing.id, project, agent, existing.loops_completed
                );
                if !self.limiter.restore_state(&existing.rate_limit) {
                    debug!("rate limit window from previous session discarded");
                }
                existing
            }
            Ok((None, expired)) => {
                if expired {
                    info!("previous session for {}/{} expired, starting fresh", project, agent);
                }
                Session::new(&project, &agent, &self.options.work_dir, &self.options.prompt)
            }
        };
        session.status = SessionStatus::Running;

        let mut iteration: u32 = 1;
        let exit_reason;
        let mut run_error: Option<RunError> = None;

        loop {
            if iteration > self.options.max_loops {
                exit_reason = "max loops reached".to_string();
                run_error = Some(RunError::MaxLoops(self.options.max_loops));
                break;
            }
            if cancel.is_cancelled() {
                exit_reason = "context cancelled".to_string();
                run_error = Some(RunError::Cancelled);
                session.status = SessionStatus::Stopped;
                break;
            }
            if self.circuit.is_tripped() {
                let reason = self.circuit.trip_reason();
                exit_reason = reason.clone();
                run_error = Some(RunError::CircuitTripped(reason));
                session.status = SessionStatus::Failed;
                break;
            }

            // Rate limiter gate: waiting out the window does not consume an
            // iteration.
            if !self.limiter.is_disabled() && !self.limiter.allow() {
                let reset = self.limiter.reset_time();
                let wait = (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                info!(
                    "rate limit reached ({} calls), waiting {:?} for window reset",
                    self.limiter.call_count(),
                    wait
                );
                if !sleep_cancellable(cancel, wait).await {
                    exit_reason = "context cancelled".to_string();
                    run_error = Some(RunError::Cancelled);
                    session.status = SessionStatus::Stopped;
                    break;
                }
                continue;
            }

            if let Some(on_loop_start) = &self.callbacks.on_loop_start {
                on_loop_start(iteration);
            }
            info!("starting loop {} of {}", iteration, self.options.max_loops);

            let sandbox_id = match self.provider.create().await {
                Ok(id) => id,
                Err(e) => {
                    let e = e.context("creating sandbox");
                    session.last_error = Some(format!("{:#}", e));
                    session.status = SessionStatus::Failed;
                    if let Err(save_err) = self.store.save_session(&session).await {
                        warn!("failed to persist session: {:#}", save_err);
                    }
                    exit_reason = "sandbox creation failed".to_string();
                    run_error = Some(RunError::Sandbox(e));
                    break;
                }
            };

            let outcome = self.start_container(cancel, &sandbox_id).await;

            // Teardown runs on every exit path, under its own timeout, so
            // caller cancellation cannot leak sandboxes.
            self.cleanup_sandbox(&sandbox_id).await;

            if cancel.is_cancelled() {
                exit_reason = "context cancelled".to_string();
                run_error = Some(RunError::Cancelled);
                session.status = SessionStatus::Stopped;
                break;
            }

            let analysis = analyze_stream_result(&outcome.text, outcome.result.as_ref());
            let status = analysis.status.clone();
            if let Some(code) = outcome.exit_code {
                debug!("sandbox exited with code {}", code);
            }

            if analysis.rate_limit_hit {
                warn!("rate limit reported in agent output");
                let retry = self
                    .callbacks
                    .on_rate_limit_hit
                    .as_ref()
                    .map(|cb| cb())
                    .unwrap_or(false);
                if retry {
                    info!("retrying iteration {} after rate limit pause", iteration);
                    if !sleep_cancellable(cancel, RATE_LIMIT_RETRY_DELAY).await {
                        exit_reason = "context cancelled".to_string();
                        run_error = Some(RunError::Cancelled);
                        session.status = SessionStatus::Stopped;
                        break;
                    }
                    continue;
                }
                exit_reason = "API rate limit".to_string();
                run_error = Some(RunError::RateLimitExhausted);
                session.status = SessionStatus::Failed;
                break;
            }

            // Persistence checkpoint: session save precedes the history
            // append for this iteration.
            session.record_loop(status.as_ref());
            if let Some(err) = &outcome.error {
                session.last_error = Some(err.to_string());
            }
            session.rate_limit = self.limiter.state();
            if let Err(e) = self.store.save_session(&session).await {
                warn!("failed to persist session: {:#}", e);
            }
            self.append_session_history(&session, "loop_completed", outcome.error.as_ref())
                .await;

            if let Some(on_loop_end) = &self.callbacks.on_loop_end {
                on_loop_end(
                    iteration,
                    status.as_ref(),
                    outcome.result.as_ref(),
                    outcome.error.as_ref(),
                );
            }

            let decision = self.circuit.update_with_analysis(status.as_ref(), &analysis);

            // Early warning on an error streak; at low trip thresholds this
            // coincides with the trip itself.
            if self.circuit.same_error_count() >= REPEATED_ERROR_WARNING_STREAK
                && !self.circuit.last_error_signature().is_empty()
            {
                self.append_session_history(&session, "repeated_error", outcome.error.as_ref())
                    .await;
            }

            if decision.is_complete {
                info!("strict completion: {}", decision.completion_msg);
                exit_reason = "agent signaled completion".to_string();
                session.status = SessionStatus::Completed;
                break;
            }
            if !self.options.strict_completion
                && status.as_ref().map_or(false, |s| s.is_complete())
            {
                exit_reason = "agent signaled completion".to_string();
                session.status = SessionStatus::Completed;
                break;
            }
            if let Some(err) = outcome.error {
                exit_reason = err.to_string();
                session.status = SessionStatus::Failed;
                run_error = Some(match err {
                    IterationError::Sandbox(e) => RunError::Sandbox(e),
                    IterationError::Stream(msg) => RunError::Stream(msg),
                    IterationError::Timeout(d) => {
                        RunError::Stream(format!("stream did not terminate within {:?}", d))
                    }
                });
                break;
            }
            if decision.tripped {
                self.persist_trip(&project, &agent).await;
                exit_reason = decision.reason.clone();
                run_error = Some(RunError::CircuitTripped(decision.reason));
                session.status = SessionStatus::Failed;
                break;
            }

            if !sleep_cancellable(cancel, self.options.loop_delay).await {
                exit_reason = "context cancelled".to_string();
                run_error = Some(RunError::Cancelled);
                session.status = SessionStatus::Stopped;
                break;
            }
            iteration += 1;
        }

        if session.status != SessionStatus::Running {
            session.updated_at = Utc::now();
            if let Err(e) = self.store.save_session(&session).await {
                warn!("failed to persist final session state: {:#}", e);
            }
        }

        info!("run finished: {} ({} loops)", exit_reason, session.loops_completed);
        RunResult {
            loops_completed: session.loops_completed,
            exit_reason,
            error: run_error,
        }
    }

    /// One iteration's stream lifecycle: attach before start, demultiplex
    /// the attach stream, parse NDJSON, wait for sandbox exit, join all
    /// auxiliary tasks before returning.
    async fn start_container(&self, cancel: &CancellationToken, id: &str) -> IterationOutcome {
        let iter_cancel = cancel.child_token();

        // Watchdog enforcing the per-iteration timeout by cancelling the
        // child token; the parent token is unaffected.
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let token = iter_cancel.clone();
            let timed_out = timed_out.clone();
            let timeout = self.options.loop_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            })
        };

        // Attach before start so a short-lived sandbox cannot race past us.
        let attach = match self.provider.attach(id).await {
            Ok(stream) => stream,
            Err(e) => {
                iter_cancel.cancel();
                let _ = watchdog.await;
                return IterationOutcome {
                    text: String::new(),
                    result: None,
                    exit_code: None,
                    error: Some(IterationError::Sandbox(e.context("attaching to sandbox"))),
                };
            }
        };

        let (read_half, write_half) = tokio::io::duplex(PIPE_CAPACITY);

        let demux_task = {
            let token = iter_cancel.clone();
            tokio::spawn(async move {
                let mut write_half = write_half;
                tokio::select! {
                    _ = token.cancelled() => (BoundedBuffer::new(STDERR_CAPTURE_BYTES), Ok(())),
                    out = demux_stream(attach, &mut write_half) => out,
                }
                // write_half drops here, signalling EOF to the parser.
            })
        };

        let wait_task = {
            let token = iter_cancel.clone();
            let provider = self.provider.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => None,
                    res = provider.wait(&id) => Some(res),
                }
            })
        };

        let parse_task = {
            let token = iter_cancel.clone();
            let callbacks = self.callbacks.clone();
            tokio::spawn(async move {
                let mut handler = RunnerHandler {
                    accumulator: TextAccumulator::new(),
                    callbacks,
                };
                let result = parse_stream(&token, read_half, &mut handler).await;
                (handler.accumulator, result)
            })
        };

        let mut error: Option<IterationError> = None;
        if let Err(e) = self.provider.start(id).await {
            error = Some(IterationError::Sandbox(e.context("starting sandbox")));
            iter_cancel.cancel();
        }

        // Join all three auxiliary tasks; nothing below reads shared state
        // until they are done.
        let (stderr, demux_result) = match demux_task.await {
            Ok(out) => out,
            Err(join_err) => (
                BoundedBuffer::new(0),
                Err(std::io::Error::other(join_err)),
            ),
        };
        let wait_result = wait_task.await.unwrap_or(None);
        let (accumulator, parse_result) = match parse_task.await {
            Ok(out) => out,
            Err(join_err) => (
                TextAccumulator::new(),
                Err(crate::stream::StreamError::Io(std::io::Error::other(join_err))),
            ),
        };
        iter_cancel.cancel();
        let _ = watchdog.await;

        if let Err(e) = demux_result {
            warn!("attach stream demultiplexer failed: {}", e);
        }

        let exit_code = match wait_result {
            Some(Ok(code)) => Some(code),
            Some(Err(e)) => {
                if error.is_none() {
                    error = Some(IterationError::Sandbox(e.context("waiting for sandbox exit")));
                }
                None
            }
            None => None,
        };

        let mut result = None;
        match parse_result {
            Ok(event) => result = Some(event),
            Err(e) if e.is_cancelled() => {
                if timed_out.load(Ordering::SeqCst) && error.is_none() {
                    error = Some(IterationError::Timeout(self.options.loop_timeout));
                }
                // Parent cancellation is reported by the caller, not here.
            }
            Err(e) => {
                if error.is_none() {
                    let mut message = e.to_string();
                    if !stderr.is_empty() {
                        message = format!("{} (stderr: {})", message, stderr.as_lossy_string().trim());
                    }
                    error = Some(IterationError::Stream(message));
                }
            }
        }

        IterationOutcome {
            text: accumulator.into_text(),
            result,
            exit_code,
            error,
        }
    }

    async fn cleanup_sandbox(&self, id: &str) {
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.provider.remove(id, true)).await {
            Ok(Ok(())) => debug!("sandbox {} removed", id),
            Ok(Err(e)) => warn!("failed to remove sandbox {}: {:#}", id, e),
            Err(_) => warn!("removing sandbox {} timed out after {:?}", id, CLEANUP_TIMEOUT),
        }
    }

    async fn persist_trip(&self, project: &str, agent: &str) {
        let counters = self.circuit.state();
        let now = Utc::now();
        let state = CircuitState {
            tripped: true,
            trip_reason: counters.trip_reason.clone(),
            no_progress_count: counters.no_progress_count,
            tripped_at: Some(now),
            updated_at: now,
        };
        if let Err(e) = self.store.save_circuit_state(project, agent, &state).await {
            warn!("failed to persist circuit state: {:#}", e);
        }
        let entry = CircuitHistoryEntry {
            timestamp: now,
            from_state: "closed".to_string(),
            to_state: "tripped".to_string(),
            reason: counters.trip_reason,
            no_progress_count: counters.no_progress_count,
            same_error_count: counters.same_error_count,
            test_loop_count: counters.consecutive_test_loops,
            completion_count: counters.consecutive_completion_count,
        };
        if let Err(e) = self.history.add_circuit_entry(project, agent, entry).await {
            warn!("failed to append circuit history: {:#}", e);
        }
    }

    async fn append_session_history(
        &self,
        session: &Session,
        event: &str,
        error: Option<&IterationError>,
    ) {
        let entry = SessionHistoryEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            loop_count: session.loops_completed,
            status: session.status.to_string(),
            error: error.map(|e| e.to_string()),
        };
        if let Err(e) = self
            .history
            .add_session_entry(&session.project, &session.agent, entry)
            .await
        {
            warn!("failed to append session history: {:#}", e);
        }
    }
}

/// Sleep that aborts on cancellation; returns false when cancelled.
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
