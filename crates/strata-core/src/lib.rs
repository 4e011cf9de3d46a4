//! Strata Cache Core
//!
//! The shared error taxonomy used across the cache engine and its CLI. Kept
//! deliberately small: this crate has no I/O and no async dependency so it
//! can be pulled in by anything that needs to name an engine error without
//! dragging in tokio, tar, or any backend SDK.

pub mod error;

pub use error::{Error, Result};
