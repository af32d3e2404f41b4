//! Bounded autonomous loop engine for LLM coding agents.
//!
//! Each iteration creates a fresh execution sandbox, streams the agent's
//! NDJSON output, extracts a structured progress record, and lets a
//! multi-condition circuit breaker decide whether to continue, declare
//! success, or halt. Per-(project, agent) state persists across invocations.
//!
//! Sandbox providers are external: implement [`sandbox::SandboxProvider`]
//! and hand it to [`runner::Runner`].

pub mod analyzer;
pub mod circuit;
pub mod config;
pub mod models;
pub mod ratelimit;
pub mod runner;
pub mod sandbox;
pub mod status;
pub mod store;
pub mod stream;
