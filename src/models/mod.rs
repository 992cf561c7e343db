//! Domain model module declarations.

pub mod artifact;
pub mod checkpoint;
pub mod message;
pub mod payload;
pub mod trace;
