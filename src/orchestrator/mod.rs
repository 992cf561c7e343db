//! Server-side agent orchestration.
//!
//! Covers the per-thread interrupt/resume state machine and the bounded
//! agent loop that drives a turn to its next suspend point.

pub mod agent_loop;
pub mod thread_run;
