//! Marker and state file persistence.
//!
//! This module provides:
//! - Atomic writes (temp file, fsync, rename) for bytes and JSON
//! - Tolerant JSON reads that treat a missing file as `None`

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_bytes, atomic_write_json};
