//! Secret handling re-exports.
//!
//! Callers reach the database URL through `ExposeSecret` only at the point
//! of connecting.

pub use secrecy::{ExposeSecret, SecretString};
