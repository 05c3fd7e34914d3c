//! Version information.

/// Crate version, stamped into the `@PG` header line.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
