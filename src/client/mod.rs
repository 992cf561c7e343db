//! Client-side streaming session orchestration.

pub mod rate_limit;
pub mod session;
pub mod transport;
