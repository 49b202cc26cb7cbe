//! # Sessions
//!
//! Wires the four components together for one viewer. Opening a session
//! subscribes to the topic, fetches history, and from then on every live
//! change flows through the store and the aggregator before an
//! [`EngineUpdate`] tells the UI to re-render.
//!
//! Sessions on the same topic share one binding, and its state is dropped
//! with the last session. Once the inbox is loaded, a viewer-wide feed keeps
//! the conversation list's unread counts live.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use shared::{
    CommentRecord, ConversationRecord, LikeRecord, MediaRef, MessageRecord, PostId, ProfileRecord,
    RowId, SyncConfig, Table, Topic, UserId, config::BucketSettings,
};
use tokio::sync::{self as async_sync, broadcast, watch};
use tracing::{debug, info, instrument};

use crate::{
    aggregator::{PlatformReceipts, ReadReceipts, UnreadAggregator, UnreadState},
    backoff::BackoffPolicy,
    error::{PlatformError, SyncError, SyncResult},
    event::{ChangeEvent, ChangeKind, Entity, EntityType},
    lock,
    memory::MemoryBackend,
    normalizer::ErrorSink,
    provider::{DataPlatform, FeedProvider, Filter, ObjectStorage, Query, select_as},
    store::{Body, Item, LocalId, ReconciliationStore},
    subscription::{EventCallback, SubscriptionHandle, SubscriptionManager, SubscriptionStatus},
};

/// Notice that a topic's visible state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineUpdate {
    /// Topic to re-render.
    pub topic: Topic,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt<R> {
    /// Key of the optimistic entry shown while sending.
    pub local_id: LocalId,
    /// Row as stored by the backend.
    pub record: R,
}

/// One line of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    /// Backend conversation id, once known.
    pub conversation_id: Option<RowId>,
    /// Conversation topic.
    pub topic: Topic,
    /// The other participant.
    pub peer: ProfileRecord,
    /// Unread messages from the peer.
    pub unread_count: u64,
    /// Time of the latest activity.
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    conversation_id: Option<RowId>,
    profile: ProfileRecord,
}

struct EngineCore {
    viewer: UserId,
    store: ReconciliationStore,
    aggregator: UnreadAggregator,
    platform: Arc<dyn DataPlatform>,
    storage: Arc<dyn ObjectStorage>,
    buckets: BucketSettings,
    updates: broadcast::Sender<EngineUpdate>,
    peers: Mutex<HashMap<Topic, PeerEntry>>,
    bindings: Mutex<HashMap<Topic, Weak<TopicBinding>>>,
    inbox: Mutex<Option<SubscriptionHandle>>,
}

impl EngineCore {
    fn consumer(self: &Arc<Self>) -> EventCallback {
        let core = Arc::clone(self);
        Arc::new(move |event: &ChangeEvent| core.dispatch(event))
    }

    fn inbox_consumer(self: &Arc<Self>) -> EventCallback {
        let core = Arc::clone(self);
        Arc::new(move |event: &ChangeEvent| core.dispatch_inbox(event))
    }

    /// Handles a change on a bound topic's feed.
    fn dispatch(&self, event: &ChangeEvent) {
        let topic = *event.topic();
        let outcome = self.store.apply_held(topic, event);
        let counted = !self.inbox_counts(&topic) && self.count(event);
        if outcome.changed() && !counted {
            self.notify(topic);
        }
    }

    /// Handles a change on the viewer's inbox feed.
    fn dispatch_inbox(&self, event: &ChangeEvent) {
        let topic = *event.topic();
        let Some(peer) = topic.peer_of(self.viewer) else {
            return;
        };
        if event.kind() == ChangeKind::Insert && event.author() == Some(peer) {
            self.discover(topic, peer);
        }
        self.count(event);
    }

    /// Lists a conversation first seen on the inbox feed.
    fn discover(&self, topic: Topic, peer: UserId) {
        let mut peers = lock(&self.peers);
        if peers.contains_key(&topic) {
            return;
        }
        peers.insert(
            topic,
            PeerEntry {
                conversation_id: None,
                profile: ProfileRecord::unknown(peer),
            },
        );
        if !self.aggregator.is_tracked(&topic) {
            self.aggregator.track(topic, 0, None);
        }
        debug!(topic = %topic, "new conversation in inbox");
    }

    /// Folds `event` into the unread state. Returns whether it counted.
    fn count(&self, event: &ChangeEvent) -> bool {
        let topic = *event.topic();
        if !self.aggregator.on_event(event) {
            return false;
        }
        if self.is_focused(&topic) {
            // The user is looking at the topic, so the new item is already read.
            self.aggregator.mark_read(&topic);
        }
        self.notify(topic);
        true
    }

    /// Conversations are counted by the inbox feed while it is live.
    fn inbox_counts(&self, topic: &Topic) -> bool {
        matches!(topic, Topic::Conversation { .. })
            && lock(&self.inbox)
                .as_ref()
                .is_some_and(|handle| handle.status() == SubscriptionStatus::Active)
    }

    fn is_focused(&self, topic: &Topic) -> bool {
        let binding = lock(&self.bindings).get(topic).and_then(Weak::upgrade);
        binding.is_some_and(|binding| binding.focused.load(Ordering::SeqCst))
    }

    fn notify(&self, topic: Topic) {
        // No receivers just means no UI is listening.
        let _ = self.updates.send(EngineUpdate { topic });
    }

    async fn insert_as<R: DeserializeOwned>(&self, table: Table, row: Value) -> SyncResult<R> {
        let stored = self.platform.insert(table, row).await?;
        serde_json::from_value(stored).map_err(|err| PlatformError::decode(table, &err).into())
    }
}

/// Feed and local state of one topic, shared by every session on it.
struct TopicBinding {
    core: Arc<EngineCore>,
    topic: Topic,
    handle: SubscriptionHandle,
    focused: AtomicBool,
    /// Whether initial history has been merged; held while fetching it.
    history: async_sync::Mutex<bool>,
}

impl Drop for TopicBinding {
    fn drop(&mut self) {
        let mut bindings = lock(&self.core.bindings);
        if bindings
            .get(&self.topic)
            .is_some_and(|current| current.strong_count() > 0)
        {
            // A newer binding owns the topic now.
            return;
        }
        bindings.remove(&self.topic);
        self.core.store.forget(&self.topic);
        if !lock(&self.core.peers).contains_key(&self.topic) {
            self.core.aggregator.untrack(&self.topic);
        }
        debug!(topic = %self.topic, "topic released");
    }
}

/// Synchronization engine for one signed-in viewer.
pub struct SyncEngine<P> {
    core: Arc<EngineCore>,
    subscriptions: SubscriptionManager<P>,
}

impl<P> fmt::Debug for SyncEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("viewer", &self.core.viewer)
            .field("store", &self.core.store)
            .field("aggregator", &self.core.aggregator)
            .finish_non_exhaustive()
    }
}

impl SyncEngine<MemoryBackend> {
    /// Engine whose every collaborator is `backend`, signed in as `viewer`.
    #[must_use]
    pub fn in_memory(viewer: UserId, backend: &Arc<MemoryBackend>, config: &SyncConfig) -> Self {
        backend.sign_in(viewer);
        Self::new(
            viewer,
            Arc::clone(backend),
            Arc::clone(backend) as Arc<dyn DataPlatform>,
            Arc::clone(backend) as Arc<dyn ObjectStorage>,
            config,
        )
    }
}

impl<P> SyncEngine<P> {
    /// Tears down every feed. Open sessions report `Closed` afterwards.
    pub fn shutdown(&self) {
        let inbox = lock(&self.core.inbox).take();
        drop(inbox);
        self.subscriptions.close_all();
        lock(&self.core.bindings).clear();
    }
}

impl<P> Drop for SyncEngine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: FeedProvider + 'static> SyncEngine<P> {
    /// Creates an engine for `viewer` over the given collaborators.
    #[must_use]
    pub fn new(
        viewer: UserId,
        feed: Arc<P>,
        platform: Arc<dyn DataPlatform>,
        storage: Arc<dyn ObjectStorage>,
        config: &SyncConfig,
    ) -> Self {
        Self::assemble(viewer, feed, platform, storage, config, None)
    }

    /// Like [`Self::new`], handing every dropped change notification to `sink`.
    #[must_use]
    pub fn with_error_sink(
        viewer: UserId,
        feed: Arc<P>,
        platform: Arc<dyn DataPlatform>,
        storage: Arc<dyn ObjectStorage>,
        config: &SyncConfig,
        sink: ErrorSink,
    ) -> Self {
        Self::assemble(viewer, feed, platform, storage, config, Some(sink))
    }

    fn assemble(
        viewer: UserId,
        feed: Arc<P>,
        platform: Arc<dyn DataPlatform>,
        storage: Arc<dyn ObjectStorage>,
        config: &SyncConfig,
        sink: Option<ErrorSink>,
    ) -> Self {
        let receipts: Arc<dyn ReadReceipts> = Arc::new(PlatformReceipts::new(Arc::clone(&platform)));
        let (updates, _) = broadcast::channel(config.update_channel_capacity.max(1));
        let core = EngineCore {
            viewer,
            store: ReconciliationStore::from(&config.reconcile),
            aggregator: UnreadAggregator::new(viewer, receipts),
            platform,
            storage,
            buckets: config.buckets.clone(),
            updates,
            peers: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            inbox: Mutex::new(None),
        };
        Self {
            core: Arc::new(core),
            subscriptions: SubscriptionManager::new(feed, BackoffPolicy::from(&config.feed), sink),
        }
    }

    /// Signed-in viewer.
    #[must_use]
    pub fn viewer(&self) -> UserId {
        self.core.viewer
    }

    /// Receiver of re-render notices.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<EngineUpdate> {
        self.core.updates.subscribe()
    }

    /// Underlying subscription manager, for consumers that want raw events.
    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionManager<P> {
        &self.subscriptions
    }

    /// Current unread state of `topic`.
    #[must_use]
    pub fn unread(&self, topic: &Topic) -> UnreadState {
        self.core.aggregator.state_of(topic)
    }

    /// Current items of `topic`.
    #[must_use]
    pub fn snapshot(&self, topic: &Topic) -> Vec<Item> {
        self.core.store.snapshot(topic)
    }

    /// Opens the conversation with `peer`.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidInput`] for a conversation with oneself and
    /// propagates history fetch failures.
    #[instrument(name = "engine.open_conversation", skip(self), err)]
    pub async fn open_conversation(&self, peer: UserId) -> SyncResult<ConversationSession> {
        let viewer = self.core.viewer;
        if peer == viewer {
            return Err(SyncError::invalid_input("cannot open a conversation with yourself"));
        }
        let topic = Topic::conversation(viewer, peer);
        let binding = self.bind(topic);

        let mut loaded = binding.history.lock().await;
        let fetched = !*loaded;
        if fetched {
            let query = Query::from(Table::Messages)
                .filter(pair_filter(viewer, peer))
                .order_by("created_at", true);
            let rows = select_as::<MessageRecord, _>(self.core.platform.as_ref(), &query).await?;
            self.core
                .store
                .load_history(topic, rows.iter().map(Item::from_message));
            *loaded = true;
        }
        drop(loaded);

        let session = SessionInner {
            core: Arc::clone(&self.core),
            binding,
        };
        session.mark_read();
        info!(topic = %topic, fetched, "conversation opened");
        Ok(ConversationSession { inner: session, peer })
    }

    /// Opens the comment thread and like ledger of a post.
    ///
    /// # Errors
    /// Propagates history fetch failures.
    #[instrument(name = "engine.open_post", skip(self), err)]
    pub async fn open_post(&self, post_id: PostId) -> SyncResult<PostSession> {
        let topic = Topic::post(post_id);
        let binding = self.bind(topic);

        let mut loaded = binding.history.lock().await;
        let fetched = !*loaded;
        if fetched {
            let platform = self.core.platform.as_ref();
            let comments = Query::from(Table::Comments)
                .filter(Filter::eq("post_id", post_id))
                .order_by("created_at", true);
            let likes = Query::from(Table::Likes).filter(Filter::eq("post_id", post_id));
            let comments = select_as::<CommentRecord, _>(platform, &comments).await?;
            let likes = select_as::<LikeRecord, _>(platform, &likes).await?;

            self.core.store.load_likes(topic, likes);
            self.core
                .store
                .load_history(topic, comments.iter().map(Item::from_comment));
            *loaded = true;
        }
        drop(loaded);

        let session = SessionInner {
            core: Arc::clone(&self.core),
            binding,
        };
        session.mark_read();
        info!(topic = %topic, fetched, "post opened");
        Ok(PostSession {
            inner: session,
            post_id,
        })
    }

    /// Reloads the conversation list and seeds unread counts from the backend.
    ///
    /// The first call also attaches the viewer's inbox feed, which keeps the
    /// counts live and lists conversations started afterwards.
    ///
    /// # Errors
    /// Propagates query failures.
    #[instrument(name = "engine.refresh_inbox", skip(self), err)]
    pub async fn refresh_inbox(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.attach_inbox();

        let viewer = self.core.viewer;
        let platform = self.core.platform.as_ref();
        let query = Query::from(Table::Conversations)
            .filter(Filter::or(vec![
                Filter::eq("participant1_id", viewer.to_string()),
                Filter::eq("participant2_id", viewer.to_string()),
            ]))
            .order_by("last_message_at", false);
        let conversations: Vec<ConversationRecord> = select_as(platform, &query).await?;

        for conversation in conversations {
            let peer = conversation.other_participant(viewer);
            let profile_query = Query::from(Table::Profiles)
                .filter(Filter::eq("id", peer.to_string()))
                .limit(1);
            let profile = select_as::<ProfileRecord, _>(platform, &profile_query)
                .await?
                .into_iter()
                .next()
                .unwrap_or_else(|| ProfileRecord::unknown(peer));

            let unread_query = Query::from(Table::Messages).filter(Filter::and(vec![
                Filter::eq("sender_id", peer.to_string()),
                Filter::eq("receiver_id", viewer.to_string()),
                Filter::eq("is_read", false),
            ]));
            let unread = platform.count(&unread_query).await?;

            let topic = Topic::conversation(viewer, peer);
            self.core
                .aggregator
                .track(topic, unread, Some(conversation.last_message_at));
            lock(&self.core.peers).insert(
                topic,
                PeerEntry {
                    conversation_id: Some(conversation.id),
                    profile,
                },
            );
        }

        Ok(self.inbox())
    }

    /// Tracked conversations, most recently active first.
    #[must_use]
    pub fn inbox(&self) -> Vec<ConversationSummary> {
        let viewer = self.core.viewer;
        let peers = lock(&self.core.peers);
        self.core
            .aggregator
            .summaries()
            .into_iter()
            .filter_map(|state| {
                let peer = state.topic.peer_of(viewer)?;
                let entry = peers.get(&state.topic);
                Some(ConversationSummary {
                    conversation_id: entry.and_then(|entry| entry.conversation_id),
                    topic: state.topic,
                    peer: entry.map_or_else(
                        || ProfileRecord {
                            id: peer,
                            username: None,
                            avatar_url: None,
                        },
                        |entry| entry.profile.clone(),
                    ),
                    unread_count: state.unread_count,
                    last_activity_at: state.last_activity_at,
                })
            })
            .collect()
    }

    fn attach_inbox(&self) {
        let mut inbox = lock(&self.core.inbox);
        if inbox
            .as_ref()
            .is_some_and(|handle| handle.status() != SubscriptionStatus::Closed)
        {
            return;
        }
        let topic = Topic::inbox(self.core.viewer);
        let handle = self.subscriptions.subscribe(topic, self.core.inbox_consumer());
        let stale = inbox.replace(handle);
        drop(inbox);
        drop(stale);
        debug!(topic = %topic, "inbox feed attached");
    }

    /// Reuses the live binding for `topic` or creates one with history pending.
    fn bind(&self, topic: Topic) -> Arc<TopicBinding> {
        let mut bindings = lock(&self.core.bindings);
        let current = bindings.get(&topic).and_then(Weak::upgrade);
        if let Some(existing) = &current {
            if existing.handle.status() != SubscriptionStatus::Closed {
                return Arc::clone(existing);
            }
        }

        // Nothing was listening, so cached items may be stale.
        self.core.store.forget(&topic);
        self.core.store.begin_history(topic);
        if !self.core.aggregator.is_tracked(&topic) {
            self.core.aggregator.track(topic, 0, None);
        }

        let binding = Arc::new(TopicBinding {
            core: Arc::clone(&self.core),
            topic,
            handle: self.subscriptions.subscribe(topic, self.core.consumer()),
            focused: AtomicBool::new(true),
            history: async_sync::Mutex::new(false),
        });
        bindings.insert(topic, Arc::downgrade(&binding));
        drop(bindings);
        // Released outside the lock, since the last reference takes it on drop.
        drop(current);
        debug!(topic = %topic, "topic bound");
        binding
    }
}

fn pair_filter(a: UserId, b: UserId) -> Filter {
    Filter::or(vec![
        Filter::and(vec![
            Filter::eq("sender_id", a.to_string()),
            Filter::eq("receiver_id", b.to_string()),
        ]),
        Filter::and(vec![
            Filter::eq("sender_id", b.to_string()),
            Filter::eq("receiver_id", a.to_string()),
        ]),
    ])
}

struct SessionInner {
    core: Arc<EngineCore>,
    binding: Arc<TopicBinding>,
}

impl SessionInner {
    fn topic(&self) -> Topic {
        self.binding.topic
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.binding.handle.status() == SubscriptionStatus::Closed {
            return Err(SyncError::session_closed(&self.binding.topic));
        }
        Ok(())
    }

    fn append_local(&self, body: Body) -> LocalId {
        let local_id = self
            .core
            .store
            .append_local(self.topic(), Item::local(self.core.viewer, body));
        self.core.notify(self.topic());
        local_id
    }

    /// Applies a mutation the backend has acknowledged without waiting for the feed.
    fn confirm(&self, kind: ChangeKind, entity_type: EntityType, entity: Entity) {
        let topic = self.topic();
        let at = entity.created_at().unwrap_or_else(Utc::now);
        let event = ChangeEvent::new(topic, kind, entity_type, entity, at);
        if self.core.store.apply_remote(topic, &event).changed() {
            self.core.notify(topic);
        }
    }

    fn own_item(&self, id: RowId) -> SyncResult<Option<Item>> {
        let item = self
            .core
            .store
            .snapshot(&self.binding.topic)
            .into_iter()
            .find(|item| item.id == Some(id));
        match item {
            Some(item) if item.author_id != self.core.viewer => Err(SyncError::invalid_input(
                format!("item {id} belongs to another user"),
            )),
            other => Ok(other),
        }
    }

    fn mark_read(&self) {
        self.core.aggregator.mark_read(&self.binding.topic);
        self.core.notify(self.topic());
    }

    fn set_focused(&self, focused: bool) {
        self.binding.focused.store(focused, Ordering::SeqCst);
        if focused {
            self.mark_read();
        }
    }

    fn discard_local(&self, local_id: LocalId) -> bool {
        let discarded = self.core.store.discard_local(&self.binding.topic, local_id);
        if discarded {
            self.core.notify(self.topic());
        }
        discarded
    }

    fn snapshot(&self) -> Vec<Item> {
        self.core.store.snapshot(&self.binding.topic)
    }

    fn unread(&self) -> UnreadState {
        self.core.aggregator.state_of(&self.binding.topic)
    }

    fn status(&self) -> SubscriptionStatus {
        self.binding.handle.status()
    }

    fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.binding.handle.status_receiver()
    }
}

/// Operations shared by every session kind.
macro_rules! session_common {
    ($session:ty) => {
        impl $session {
            /// Topic of this session.
            #[must_use]
            pub fn topic(&self) -> Topic {
                self.inner.topic()
            }

            /// Visible items in display order.
            #[must_use]
            pub fn snapshot(&self) -> Vec<Item> {
                self.inner.snapshot()
            }

            /// Unread state of the topic.
            #[must_use]
            pub fn unread(&self) -> UnreadState {
                self.inner.unread()
            }

            /// Feed status.
            #[must_use]
            pub fn status(&self) -> SubscriptionStatus {
                self.inner.status()
            }

            /// Receiver observing feed status changes.
            #[must_use]
            pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
                self.inner.status_receiver()
            }

            /// Zeroes the unread count and acknowledges remotely.
            pub fn mark_read(&self) {
                self.inner.mark_read();
            }

            /// While focused, new items from others are marked read on arrival.
            pub fn set_focused(&self, focused: bool) {
                self.inner.set_focused(focused);
            }

            /// Drops an optimistic entry whose send failed.
            pub fn discard_local(&self, local_id: LocalId) -> bool {
                self.inner.discard_local(local_id)
            }

            /// Leaves the session; the feed closes once no session uses it.
            pub fn close(self) {
                debug!(topic = %self.inner.topic(), "session closed");
            }
        }

        impl fmt::Debug for $session {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($session))
                    .field("topic", &self.inner.topic())
                    .field("status", &self.inner.status())
                    .finish_non_exhaustive()
            }
        }
    };
}

/// Live view of a direct conversation.
pub struct ConversationSession {
    inner: SessionInner,
    peer: UserId,
}

session_common!(ConversationSession);

impl ConversationSession {
    /// The other participant.
    #[must_use]
    pub const fn peer(&self) -> UserId {
        self.peer
    }

    /// Sends a text message, showing it immediately.
    ///
    /// On failure the optimistic entry stays visible; see [`Self::discard_local`].
    ///
    /// # Errors
    /// Rejects blank text and closed sessions; propagates insert failures.
    #[instrument(name = "session.send_text", skip(self, text), fields(topic = %self.inner.topic()), err)]
    pub async fn send_text(&self, text: &str) -> SyncResult<SendReceipt<MessageRecord>> {
        if text.trim().is_empty() {
            return Err(SyncError::invalid_input("message text is empty"));
        }
        self.inner.ensure_open()?;

        let local_id = self.inner.append_local(Body::text(text));
        let row = json!({
            "sender_id": self.inner.core.viewer,
            "receiver_id": self.peer,
            "content": text,
        });
        let record: MessageRecord = self.inner.core.insert_as(Table::Messages, row).await?;
        self.inner.confirm(
            ChangeKind::Insert,
            EntityType::Message,
            Entity::Message(record.clone()),
        );
        Ok(SendReceipt { local_id, record })
    }

    /// Uploads a media file and sends it as a message.
    ///
    /// # Errors
    /// Rejects empty files and names without an extension; propagates upload
    /// and insert failures.
    #[instrument(name = "session.send_media", skip(self, bytes), fields(topic = %self.inner.topic()), err)]
    pub async fn send_media(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> SyncResult<SendReceipt<MessageRecord>> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .ok_or_else(|| SyncError::invalid_input(format!("'{file_name}' has no extension")))?;
        if bytes.is_empty() {
            return Err(SyncError::invalid_input("media file is empty"));
        }
        self.inner.ensure_open()?;

        let topic = self.inner.topic();
        let folder = topic
            .media_folder()
            .ok_or_else(|| SyncError::invalid_input("media needs a conversation"))?;
        let path = format!("{folder}/{}.{extension}", Utc::now().timestamp_millis());

        let local_id = self.inner.append_local(Body::Media(MediaRef::new(&path)));
        self.inner
            .core
            .storage
            .upload(&self.inner.core.buckets.chat_media, &path, bytes)
            .await?;

        let row = json!({
            "sender_id": self.inner.core.viewer,
            "receiver_id": self.peer,
            "media_url": path,
        });
        let record: MessageRecord = self.inner.core.insert_as(Table::Messages, row).await?;
        self.inner.confirm(
            ChangeKind::Insert,
            EntityType::Message,
            Entity::Message(record.clone()),
        );
        Ok(SendReceipt { local_id, record })
    }

    /// Deletes one of the viewer's messages, removing its media blob first.
    ///
    /// # Errors
    /// Rejects other users' messages; propagates storage and delete failures.
    #[instrument(name = "session.delete_message", skip(self), fields(topic = %self.inner.topic()), err)]
    pub async fn delete_message(&self, id: RowId) -> SyncResult<bool> {
        let item = self.inner.own_item(id)?;
        if let Some(Item {
            body: Body::Media(media),
            ..
        }) = &item
        {
            self.inner
                .core
                .storage
                .remove(&self.inner.core.buckets.chat_media, &[media.path.clone()])
                .await?;
        }

        let filter = Filter::and(vec![
            Filter::eq("id", id),
            Filter::eq("sender_id", self.inner.core.viewer.to_string()),
        ]);
        let removed = self.inner.core.platform.delete(Table::Messages, &filter).await?;
        self.inner
            .confirm(ChangeKind::Delete, EntityType::Message, Entity::IdOnly { id });
        Ok(removed > 0)
    }

    /// Deletes every message of the conversation and its media.
    ///
    /// # Errors
    /// Propagates storage and delete failures.
    #[instrument(name = "session.clear_history", skip(self), fields(topic = %self.inner.topic()), err)]
    pub async fn clear_history(&self) -> SyncResult<u64> {
        let confirmed: Vec<Item> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|item| item.id.is_some())
            .collect();
        let media: Vec<String> = confirmed
            .iter()
            .filter_map(|item| match &item.body {
                Body::Media(media) => Some(media.path.clone()),
                _ => None,
            })
            .collect();
        if !media.is_empty() {
            self.inner
                .core
                .storage
                .remove(&self.inner.core.buckets.chat_media, &media)
                .await?;
        }

        let filter = pair_filter(self.inner.core.viewer, self.peer);
        let removed = self.inner.core.platform.delete(Table::Messages, &filter).await?;
        for id in confirmed.iter().filter_map(|item| item.id) {
            self.inner
                .confirm(ChangeKind::Delete, EntityType::Message, Entity::IdOnly { id });
        }
        Ok(removed)
    }

    /// Fetches a media blob exchanged in this conversation.
    ///
    /// # Errors
    /// Propagates storage failures, including unknown paths.
    pub async fn download_media(&self, path: &str) -> SyncResult<Vec<u8>> {
        Ok(self
            .inner
            .core
            .storage
            .download(&self.inner.core.buckets.chat_media, path)
            .await?)
    }
}

/// Live view of a post's comments and likes.
pub struct PostSession {
    inner: SessionInner,
    post_id: PostId,
}

session_common!(PostSession);

impl PostSession {
    /// Post id.
    #[must_use]
    pub const fn post_id(&self) -> PostId {
        self.post_id
    }

    /// Posts a comment, showing it immediately.
    ///
    /// # Errors
    /// Rejects blank text and closed sessions; propagates insert failures.
    #[instrument(name = "session.add_comment", skip(self, text), fields(topic = %self.inner.topic()), err)]
    pub async fn add_comment(&self, text: &str) -> SyncResult<SendReceipt<CommentRecord>> {
        if text.trim().is_empty() {
            return Err(SyncError::invalid_input("comment text is empty"));
        }
        self.inner.ensure_open()?;

        let local_id = self.inner.append_local(Body::text(text));
        let row = json!({
            "post_id": self.post_id,
            "user_id": self.inner.core.viewer,
            "content": text,
        });
        let record: CommentRecord = self.inner.core.insert_as(Table::Comments, row).await?;
        self.inner.confirm(
            ChangeKind::Insert,
            EntityType::Comment,
            Entity::Comment(record.clone()),
        );
        Ok(SendReceipt { local_id, record })
    }

    /// Deletes one of the viewer's comments.
    ///
    /// # Errors
    /// Rejects other users' comments; propagates delete failures.
    #[instrument(name = "session.delete_comment", skip(self), fields(topic = %self.inner.topic()), err)]
    pub async fn delete_comment(&self, id: RowId) -> SyncResult<bool> {
        self.inner.own_item(id)?;
        let filter = Filter::and(vec![
            Filter::eq("id", id),
            Filter::eq("user_id", self.inner.core.viewer.to_string()),
        ]);
        let removed = self.inner.core.platform.delete(Table::Comments, &filter).await?;
        self.inner
            .confirm(ChangeKind::Delete, EntityType::Comment, Entity::IdOnly { id });
        Ok(removed > 0)
    }

    /// Likes the post. Returns `false` if the viewer already liked it.
    ///
    /// # Errors
    /// Propagates insert failures.
    #[instrument(name = "session.like", skip(self), fields(topic = %self.inner.topic()), err)]
    pub async fn like(&self) -> SyncResult<bool> {
        if self.has_liked() {
            return Ok(false);
        }
        let row = json!({ "post_id": self.post_id, "user_id": self.inner.core.viewer });
        let record: LikeRecord = self.inner.core.insert_as(Table::Likes, row).await?;
        self.inner
            .confirm(ChangeKind::Insert, EntityType::Like, Entity::Like(record));
        Ok(true)
    }

    /// Removes the viewer's like. Returns `false` if there was none.
    ///
    /// # Errors
    /// Propagates delete failures.
    #[instrument(name = "session.unlike", skip(self), fields(topic = %self.inner.topic()), err)]
    pub async fn unlike(&self) -> SyncResult<bool> {
        let topic = self.inner.topic();
        let Some(id) = self.inner.core.store.like_of(&topic, self.inner.core.viewer) else {
            return Ok(false);
        };
        let filter = Filter::and(vec![
            Filter::eq("id", id),
            Filter::eq("user_id", self.inner.core.viewer.to_string()),
        ]);
        self.inner.core.platform.delete(Table::Likes, &filter).await?;
        self.inner
            .confirm(ChangeKind::Delete, EntityType::Like, Entity::IdOnly { id });
        Ok(true)
    }

    /// Number of likes.
    #[must_use]
    pub fn like_count(&self) -> usize {
        self.inner.core.store.like_count(&self.inner.topic())
    }

    /// Whether the viewer likes the post.
    #[must_use]
    pub fn has_liked(&self) -> bool {
        self.inner
            .core
            .store
            .has_liked(&self.inner.topic(), self.inner.core.viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::NormalizeError, store::Origin};
    use async_trait::async_trait;
    use shared::RawChange;
    use std::time::Duration;
    use tokio::{
        sync::Semaphore,
        time::{sleep, timeout},
    };
    use uuid::Uuid;

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    fn engine_for(viewer: UserId, backend: &Arc<MemoryBackend>) -> SyncEngine<MemoryBackend> {
        SyncEngine::in_memory(viewer, backend, &SyncConfig::with_defaults())
    }

    async fn active(status: &mut watch::Receiver<SubscriptionStatus>) {
        timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == SubscriptionStatus::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn opening_loads_history_and_marks_read() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![
                json!({ "sender_id": peer, "receiver_id": viewer, "content": "one", "created_at": "2025-01-01T00:00:00Z" }),
                json!({ "sender_id": viewer, "receiver_id": peer, "content": "two", "created_at": "2025-01-01T00:01:00Z" }),
            ],
        );
        let engine = engine_for(viewer, &backend);

        let session = engine.open_conversation(peer).await.unwrap();
        settle().await;

        let bodies: Vec<Body> = session.snapshot().into_iter().map(|item| item.body).collect();
        assert_eq!(bodies, vec![Body::text("one"), Body::text("two")]);
        assert_eq!(backend.rpc_calls(), vec!["mark_messages_as_read".to_string()]);
        assert!(backend.rows(Table::Messages).iter().all(|row| row["is_read"] == json!(true) || row["sender_id"] == json!(viewer)));
    }

    #[tokio::test]
    async fn sending_text_reconciles_without_duplicates() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();
        active(&mut session.status_receiver()).await;

        let receipt = session.send_text("hi").await.unwrap();
        settle().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, Some(receipt.record.id));
        assert_eq!(snapshot[0].origin, Origin::Remote);
        assert_eq!(snapshot[0].local_id, Some(receipt.local_id));
    }

    #[tokio::test]
    async fn failed_send_keeps_the_optimistic_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(Uuid::new_v4()).await.unwrap();

        backend.fail_mutations(true);
        assert!(matches!(session.send_text("lost").await, Err(SyncError::Platform(_))));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, Origin::Local);
        assert!(session.discard_local(snapshot[0].local_id.unwrap()));
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test]
    async fn blank_messages_and_self_conversations_are_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);

        assert!(matches!(
            engine.open_conversation(viewer).await,
            Err(SyncError::InvalidInput { .. })
        ));
        let session = engine.open_conversation(Uuid::new_v4()).await.unwrap();
        assert!(matches!(session.send_text("   ").await, Err(SyncError::InvalidInput { .. })));
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test]
    async fn media_round_trip_and_delete_removes_the_blob_first() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();
        active(&mut session.status_receiver()).await;

        let receipt = session.send_media("clip.MP4", vec![1, 2, 3]).await.unwrap();
        let path = receipt.record.media_url.clone().unwrap();
        assert!(path.starts_with(&session.topic().media_folder().unwrap()));
        assert!(path.ends_with(".MP4"));
        assert_eq!(session.download_media(&path).await.unwrap(), vec![1, 2, 3]);

        settle().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(matches!(&snapshot[0].body, Body::Media(media) if media.kind == shared::MediaKind::Video));

        assert!(session.delete_message(receipt.record.id).await.unwrap());
        assert!(!backend.has_blob("chat-media", &path));
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test]
    async fn cannot_delete_someone_elses_message() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![json!({ "id": 40, "sender_id": peer, "receiver_id": viewer, "content": "theirs" })],
        );
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();

        assert!(matches!(
            session.delete_message(40).await,
            Err(SyncError::InvalidInput { .. })
        ));
        assert_eq!(backend.rows(Table::Messages).len(), 1);
    }

    #[tokio::test]
    async fn clear_history_removes_every_message_of_the_pair() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let bystander = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![
                json!({ "sender_id": peer, "receiver_id": viewer, "content": "a" }),
                json!({ "sender_id": viewer, "receiver_id": peer, "content": "b" }),
                json!({ "sender_id": viewer, "receiver_id": bystander, "content": "keep" }),
            ],
        );
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();

        assert_eq!(session.clear_history().await.unwrap(), 2);
        assert!(session.snapshot().is_empty());
        assert_eq!(backend.rows(Table::Messages).len(), 1);
    }

    #[tokio::test]
    async fn focused_sessions_mark_incoming_messages_read() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();
        active(&mut session.status_receiver()).await;

        backend
            .insert(Table::Messages, json!({ "sender_id": peer, "receiver_id": viewer, "content": "seen" }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(session.unread().unread_count, 0);

        session.set_focused(false);
        backend
            .insert(Table::Messages, json!({ "sender_id": peer, "receiver_id": viewer, "content": "later" }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(session.unread().unread_count, 1);

        session.set_focused(true);
        assert_eq!(session.unread().unread_count, 0);
    }

    #[tokio::test]
    async fn sessions_on_one_topic_share_a_feed() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);

        let first = engine.open_conversation(peer).await.unwrap();
        let second = engine.open_conversation(peer).await.unwrap();
        active(&mut first.status_receiver()).await;
        assert_eq!(engine.subscriptions().consumer_count(&first.topic()), 1);

        first.close();
        settle().await;
        assert_eq!(backend.feed_closes(), 0);
        second.close();
        settle().await;
        assert_eq!(backend.feed_opens(), 1);
        assert_eq!(backend.feed_closes(), 1);
    }

    #[tokio::test]
    async fn post_sessions_store_comments_and_likes() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let fan = Uuid::new_v4();
        backend.seed(
            Table::Comments,
            vec![json!({ "post_id": 3, "user_id": fan, "content": "first!" })],
        );
        backend.seed(Table::Likes, vec![json!({ "post_id": 3, "user_id": fan })]);
        let engine = engine_for(viewer, &backend);

        let post = engine.open_post(3).await.unwrap();
        active(&mut post.status_receiver()).await;
        assert_eq!(post.snapshot().len(), 1);
        assert_eq!(post.like_count(), 1);

        assert!(post.like().await.unwrap());
        assert!(!post.like().await.unwrap());
        assert!(post.has_liked());
        assert_eq!(post.like_count(), 2);

        let receipt = post.add_comment("me too").await.unwrap();
        settle().await;
        assert_eq!(post.snapshot().len(), 2);

        assert!(post.delete_comment(receipt.record.id).await.unwrap());
        assert!(post.unlike().await.unwrap());
        assert!(!post.unlike().await.unwrap());
        settle().await;
        assert_eq!(post.snapshot().len(), 1);
        assert_eq!(post.like_count(), 1);
    }

    #[tokio::test]
    async fn inbox_lists_conversations_by_activity_with_unread_counts() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let old_friend = Uuid::new_v4();
        let new_friend = Uuid::new_v4();
        backend.seed(
            Table::Profiles,
            vec![json!({ "id": new_friend, "username": "newbie", "avatar_url": null })],
        );
        backend.seed(
            Table::Conversations,
            vec![
                json!({ "id": 1, "participant1_id": viewer, "participant2_id": old_friend, "last_message_at": "2025-01-01T00:00:00Z" }),
                json!({ "id": 2, "participant1_id": new_friend, "participant2_id": viewer, "last_message_at": "2025-02-01T00:00:00Z" }),
            ],
        );
        backend.seed(
            Table::Messages,
            vec![
                json!({ "sender_id": new_friend, "receiver_id": viewer, "content": "a" }),
                json!({ "sender_id": new_friend, "receiver_id": viewer, "content": "b" }),
            ],
        );
        let engine = engine_for(viewer, &backend);

        let inbox = engine.refresh_inbox().await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].peer.username.as_deref(), Some("newbie"));
        assert_eq!(inbox[0].unread_count, 2);
        assert_eq!(inbox[0].conversation_id, Some(2));
        assert_eq!(inbox[1].peer.username.as_deref(), Some("Unknown User"));
        assert_eq!(inbox[1].unread_count, 0);
    }

    #[tokio::test]
    async fn every_applied_change_publishes_an_update() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let engine = engine_for(viewer, &backend);
        let session = engine.open_conversation(peer).await.unwrap();
        active(&mut session.status_receiver()).await;
        let mut updates = engine.updates();

        backend
            .insert(Table::Messages, json!({ "sender_id": peer, "receiver_id": viewer, "content": "ping" }))
            .await
            .unwrap();

        let update = timeout(Duration::from_secs(1), updates.recv()).await.unwrap().unwrap();
        assert_eq!(update.topic, session.topic());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine_for(Uuid::new_v4(), &backend);
        let session = engine.open_post(1).await.unwrap();
        active(&mut session.status_receiver()).await;

        engine.shutdown();
        let mut status = session.status_receiver();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == SubscriptionStatus::Closed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(session.add_comment("late").await, Err(SyncError::SessionClosed { .. })));
    }

    /// Fails the first history read once released; later reads pass through.
    struct FailFirstSelect {
        inner: Arc<MemoryBackend>,
        gate: Semaphore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl DataPlatform for FailFirstSelect {
        async fn select(&self, query: &Query) -> Result<Vec<Value>, PlatformError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                self.gate.acquire().await.unwrap().forget();
                return Err(PlatformError::failed("select", query.table, "connection reset"));
            }
            self.inner.select(query).await
        }

        async fn count(&self, query: &Query) -> Result<u64, PlatformError> {
            self.inner.count(query).await
        }

        async fn insert(&self, table: Table, row: Value) -> Result<Value, PlatformError> {
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: Table, filter: &Filter, changes: Value) -> Result<u64, PlatformError> {
            self.inner.update(table, filter, changes).await
        }

        async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, PlatformError> {
            self.inner.delete(table, filter).await
        }

        async fn rpc(&self, name: &str, args: Value) -> Result<Value, PlatformError> {
            self.inner.rpc(name, args).await
        }
    }

    #[tokio::test]
    async fn a_failed_first_fetch_is_retried_by_the_next_opener() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.sign_in(viewer);
        backend.seed(
            Table::Messages,
            vec![json!({ "sender_id": peer, "receiver_id": viewer, "content": "kept" })],
        );
        let platform = Arc::new(FailFirstSelect {
            inner: Arc::clone(&backend),
            gate: Semaphore::new(0),
            failed: AtomicBool::new(false),
        });
        let engine = SyncEngine::new(
            viewer,
            Arc::clone(&backend),
            Arc::clone(&platform) as Arc<dyn DataPlatform>,
            Arc::clone(&backend) as Arc<dyn ObjectStorage>,
            &SyncConfig::with_defaults(),
        );

        let release = async {
            settle().await;
            platform.gate.add_permits(1);
        };
        let (first, second, ()) = tokio::join!(
            engine.open_conversation(peer),
            engine.open_conversation(peer),
            release
        );

        assert!(matches!(first, Err(SyncError::Platform(_))));
        let second = second.unwrap();
        assert_eq!(second.snapshot().len(), 1);
        let third = engine.open_conversation(peer).await.unwrap();
        assert_eq!(third.snapshot().len(), 1);
        assert!(!engine.core.store.is_loading(&third.topic()));
    }

    #[tokio::test]
    async fn inbox_follows_live_messages_and_new_conversations() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![json!({ "sender_id": alice, "receiver_id": bob, "content": "lunch?" })],
        );
        backend.seed(
            Table::Conversations,
            vec![json!({ "id": 7, "participant1_id": alice, "participant2_id": bob })],
        );
        let engine = engine_for(bob, &backend);

        let inbox = engine.refresh_inbox().await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].unread_count, 1);
        settle().await;

        for text in ["noon?", "or one?"] {
            backend
                .insert(Table::Messages, json!({ "sender_id": alice, "receiver_id": bob, "content": text }))
                .await
                .unwrap();
        }
        backend
            .insert(Table::Messages, json!({ "sender_id": carol, "receiver_id": bob, "content": "hi bob" }))
            .await
            .unwrap();
        backend
            .insert(Table::Messages, json!({ "sender_id": carol, "receiver_id": alice, "content": "not yours" }))
            .await
            .unwrap();
        settle().await;

        let inbox = engine.inbox();
        assert_eq!(inbox.len(), 2);
        let from_alice = inbox.iter().find(|summary| summary.peer.id == alice).unwrap();
        assert_eq!(from_alice.unread_count, 3);
        assert_eq!(from_alice.conversation_id, Some(7));
        let from_carol = inbox.iter().find(|summary| summary.peer.id == carol).unwrap();
        assert_eq!(from_carol.unread_count, 1);
        assert_eq!(from_carol.conversation_id, None);

        // An open session and the inbox feed count each message once.
        let session = engine.open_conversation(alice).await.unwrap();
        active(&mut session.status_receiver()).await;
        session.set_focused(false);
        backend
            .insert(Table::Messages, json!({ "sender_id": alice, "receiver_id": bob, "content": "hello?" }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(session.unread().unread_count, 1);

        engine.shutdown();
        settle().await;
        assert_eq!(backend.feed_opens(), 2);
        assert_eq!(backend.feed_closes(), 2);
    }

    #[tokio::test]
    async fn malformed_rows_reach_the_engine_error_sink() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.sign_in(viewer);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&reported);
        let sink: ErrorSink = Arc::new(move |topic: &Topic, err: &NormalizeError| {
            log.lock().unwrap().push((*topic, err.to_string()));
        });
        let engine = SyncEngine::with_error_sink(
            viewer,
            Arc::clone(&backend),
            Arc::clone(&backend) as Arc<dyn DataPlatform>,
            Arc::clone(&backend) as Arc<dyn ObjectStorage>,
            &SyncConfig::with_defaults(),
            sink,
        );
        let session = engine.open_conversation(peer).await.unwrap();
        active(&mut session.status_receiver()).await;

        backend.publish(RawChange::insert(Table::Messages, json!({ "id": "broken" })));
        backend
            .insert(Table::Messages, json!({ "sender_id": peer, "receiver_id": viewer, "content": "fine" }))
            .await
            .unwrap();
        settle().await;

        let reported = reported.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, session.topic());
        assert_eq!(session.status(), SubscriptionStatus::Active);
        assert_eq!(session.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn closing_the_last_session_releases_topic_state() {
        let backend = Arc::new(MemoryBackend::new());
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.seed(
            Table::Conversations,
            vec![json!({ "participant1_id": viewer, "participant2_id": peer })],
        );
        backend.seed(Table::Comments, vec![json!({ "post_id": 9, "user_id": peer, "content": "nice" })]);
        let engine = engine_for(viewer, &backend);
        engine.refresh_inbox().await.unwrap();

        let post = engine.open_post(9).await.unwrap();
        let also_post = engine.open_post(9).await.unwrap();
        let chat = engine.open_conversation(peer).await.unwrap();
        let post_topic = post.topic();
        let chat_topic = chat.topic();
        assert!(engine.core.aggregator.is_tracked(&post_topic));

        post.close();
        assert!(engine.core.store.holds(&post_topic));
        also_post.close();
        chat.close();

        assert!(!engine.core.store.holds(&post_topic));
        assert!(!engine.core.aggregator.is_tracked(&post_topic));
        assert!(!engine.core.store.holds(&chat_topic));
        assert!(engine.core.aggregator.is_tracked(&chat_topic));
        assert_eq!(engine.inbox().len(), 1);

        let reopened = engine.open_post(9).await.unwrap();
        assert_eq!(reopened.snapshot().len(), 1);
    }
}
