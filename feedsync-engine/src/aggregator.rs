//! # Unread/Presence Aggregator
//!
//! Derives unread counts and last-activity times from change events. State
//! only exists for topics explicitly tracked; passive events never create it.

use std::{
    cmp::Reverse,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use shared::{Topic, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    error::PlatformError,
    event::{ChangeEvent, ChangeKind},
    lock,
    provider::DataPlatform,
};

/// Backend procedure flagging a peer's messages to the caller as read.
pub const MARK_READ_PROCEDURE: &str = "mark_messages_as_read";

/// Derived unread state of one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnreadState {
    /// Topic.
    pub topic: Topic,
    /// Inserts by others since the last read.
    pub unread_count: u64,
    /// Server time of the latest insert by others.
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl UnreadState {
    const fn empty(topic: Topic) -> Self {
        Self {
            topic,
            unread_count: 0,
            last_activity_at: None,
        }
    }
}

/// Persists read acknowledgements remotely.
#[async_trait]
pub trait ReadReceipts: Send + Sync {
    /// Tells the backend that `viewer` has read everything on `topic`.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the acknowledgement is rejected.
    async fn acknowledge(&self, viewer: UserId, topic: &Topic) -> Result<(), PlatformError>;
}

/// [`ReadReceipts`] over a [`DataPlatform`] procedure call.
pub struct PlatformReceipts<D: ?Sized> {
    platform: Arc<D>,
}

impl<D: ?Sized> PlatformReceipts<D> {
    /// Wraps `platform`.
    pub const fn new(platform: Arc<D>) -> Self {
        Self { platform }
    }
}

impl<D: ?Sized> fmt::Debug for PlatformReceipts<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformReceipts").finish_non_exhaustive()
    }
}

#[async_trait]
impl<D: DataPlatform + ?Sized> ReadReceipts for PlatformReceipts<D> {
    async fn acknowledge(&self, viewer: UserId, topic: &Topic) -> Result<(), PlatformError> {
        // Post topics have no per-reader state on the backend.
        let Some(peer) = topic.peer_of(viewer) else {
            return Ok(());
        };
        self.platform
            .rpc(MARK_READ_PROCEDURE, json!({ "sender_id_param": peer }))
            .await
            .map(|_| ())
    }
}

/// Per-topic unread counters for one viewer.
pub struct UnreadAggregator {
    viewer: UserId,
    states: Mutex<HashMap<Topic, UnreadState>>,
    receipts: Option<Arc<dyn ReadReceipts>>,
}

impl fmt::Debug for UnreadAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnreadAggregator")
            .field("viewer", &self.viewer)
            .field("tracked", &lock(&self.states).len())
            .field("has_receipts", &self.receipts.is_some())
            .finish()
    }
}

impl UnreadAggregator {
    /// Aggregator acknowledging reads through `receipts`.
    #[must_use]
    pub fn new(viewer: UserId, receipts: Arc<dyn ReadReceipts>) -> Self {
        Self {
            viewer,
            states: Mutex::new(HashMap::new()),
            receipts: Some(receipts),
        }
    }

    /// Aggregator without remote acknowledgement.
    #[must_use]
    pub fn local_only(viewer: UserId) -> Self {
        Self {
            viewer,
            states: Mutex::new(HashMap::new()),
            receipts: None,
        }
    }

    /// Viewer whose own inserts never count as unread.
    #[must_use]
    pub const fn viewer(&self) -> UserId {
        self.viewer
    }

    /// Starts tracking `topic`, or reseeds it from an authoritative count.
    pub fn track(&self, topic: Topic, seed_unread: u64, last_activity: Option<DateTime<Utc>>) {
        let mut states = lock(&self.states);
        let state = states.entry(topic).or_insert_with(|| UnreadState::empty(topic));
        state.unread_count = seed_unread;
        state.last_activity_at = state.last_activity_at.max(last_activity);
        debug!(topic = %topic, unread = seed_unread, "tracking topic");
    }

    /// Stops tracking `topic`.
    pub fn untrack(&self, topic: &Topic) {
        lock(&self.states).remove(topic);
    }

    /// Whether `topic` is tracked.
    #[must_use]
    pub fn is_tracked(&self, topic: &Topic) -> bool {
        lock(&self.states).contains_key(topic)
    }

    /// Folds one change into the derived state. Returns whether it counted.
    pub fn on_event(&self, event: &ChangeEvent) -> bool {
        if event.kind() != ChangeKind::Insert {
            return false;
        }
        let Some(author) = event.author() else {
            return false;
        };
        if author == self.viewer {
            return false;
        }

        let mut states = lock(&self.states);
        let Some(state) = states.get_mut(event.topic()) else {
            return false;
        };
        state.unread_count += 1;
        state.last_activity_at = state.last_activity_at.max(Some(event.server_timestamp()));
        true
    }

    /// Zeroes the local count and acknowledges remotely in the background.
    ///
    /// A failed acknowledgement is logged and counted but never restores the
    /// count. Returns the acknowledgement task when one was started, which
    /// requires receipts and a running Tokio runtime.
    pub fn mark_read(&self, topic: &Topic) -> Option<JoinHandle<()>> {
        if let Some(state) = lock(&self.states).get_mut(topic) {
            state.unread_count = 0;
        }

        let receipts = Arc::clone(self.receipts.as_ref()?);
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let viewer = self.viewer;
        let topic = *topic;
        Some(runtime.spawn(async move {
            if let Err(err) = receipts.acknowledge(viewer, &topic).await {
                warn!(topic = %topic, error = %err, "read acknowledgement failed");
                counter!("feedsync_read_ack_failures_total").increment(1);
            }
        }))
    }

    /// Current state; untracked topics report zero.
    #[must_use]
    pub fn state_of(&self, topic: &Topic) -> UnreadState {
        lock(&self.states)
            .get(topic)
            .copied()
            .unwrap_or_else(|| UnreadState::empty(*topic))
    }

    /// Tracked topics, most recently active first.
    #[must_use]
    pub fn summaries(&self) -> Vec<UnreadState> {
        let mut states: Vec<UnreadState> = lock(&self.states).values().copied().collect();
        states.sort_by_key(|state| (Reverse(state.last_activity_at), state.topic));
        states
    }

    /// Sum of unread counts across tracked topics.
    #[must_use]
    pub fn total_unread(&self) -> u64 {
        lock(&self.states)
            .values()
            .map(|state| state.unread_count)
            .sum()
    }
}
