//! Version information for isolator.

/// Isolator version from Cargo.toml
pub const ISOLATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
