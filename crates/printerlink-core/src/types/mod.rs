//! Type system utilities and aliases.
//!
//! - [`aliases`]: Shared map alias used for listener registries.

pub mod aliases;

pub use aliases::*;
