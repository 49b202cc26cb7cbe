#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! Real-time conversation synchronization engine.
//!
//! Raw change notifications from a hosted data platform are normalized into
//! [`ChangeEvent`]s, fanned out by the [`SubscriptionManager`] (one feed per
//! topic), folded into per-topic item lists by the [`ReconciliationStore`],
//! and counted by the [`UnreadAggregator`]. [`SyncEngine`] wires these
//! together for a signed-in viewer.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod aggregator;
pub mod backoff;
pub mod error;
pub mod event;
pub mod memory;
pub mod normalizer;
pub mod provider;
pub mod session;
pub mod store;
pub mod subscription;
pub mod tracer;

pub use aggregator::{PlatformReceipts, ReadReceipts, UnreadAggregator, UnreadState};
pub use backoff::BackoffPolicy;
pub use error::{FeedError, NormalizeError, PlatformError, StorageError, SyncError, SyncResult};
pub use event::{ChangeEvent, ChangeKind, Entity, EntityType};
pub use memory::MemoryBackend;
pub use normalizer::{ErrorSink, Normalizer};
pub use provider::{DataPlatform, FeedProvider, Filter, ObjectStorage, Query, RawFeed};
pub use session::{
    ConversationSession, ConversationSummary, EngineUpdate, PostSession, SendReceipt, SyncEngine,
};
pub use store::{Body, Item, LocalId, Origin, ReconciliationStore, RemoteOutcome};
pub use subscription::{
    EventCallback, SubscriptionHandle, SubscriptionManager, SubscriptionStatus,
};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
