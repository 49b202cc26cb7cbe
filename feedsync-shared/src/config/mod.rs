//! # Configuration
//!
//! This module contains the engine configuration and its layered loader
//! (defaults, then file, then environment).

pub mod sync;

pub use sync::{BucketSettings, ConfigError, FeedSettings, ReconcileSettings, SyncConfig};
