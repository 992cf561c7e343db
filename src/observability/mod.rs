//! Observability: projection of assistant trace bundles.

pub mod projection;
