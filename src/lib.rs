#![forbid(unsafe_code)]

//! Resumable human-in-the-loop agent conversations.
//!
//! Checkpointed thread state, idempotent trace projection, and the
//! client-side streaming session orchestrator that drives them.

pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod persistence;
pub mod retry;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
