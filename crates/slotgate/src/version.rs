//! Version information for slotgate.

/// Slotgate version from Cargo.toml
pub const SLOTGATE_VERSION: &str = env!("CARGO_PKG_VERSION");
