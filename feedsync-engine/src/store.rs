//! # Optimistic Reconciliation Store
//!
//! Exclusive owner of each topic's visible item list. Locally sent items show
//! up immediately as pending entries and are folded into the confirmed row
//! when the matching insert arrives from the feed, so the UI never renders the
//! same message twice.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use serde::Serialize;
use shared::{
    CommentRecord, LikeRecord, MediaRef, MessageRecord, RowId, Topic, UserId,
    config::ReconcileSettings,
};
use tracing::{debug, trace};

use crate::{
    event::{ChangeEvent, ChangeKind, Entity, EntityType},
    lock,
};

/// Temporary key of an optimistic item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LocalId(u64);

impl LocalId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Displayable content of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Body {
    /// Plain text.
    Text(String),
    /// Stored media object.
    Media(MediaRef),
    /// Nothing to render.
    Empty,
}

impl Body {
    /// Text body.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    fn from_text(content: Option<&str>) -> Self {
        match content {
            Some(text) if !text.is_empty() => Self::Text(text.to_string()),
            _ => Self::Empty,
        }
    }
}

/// Where an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Optimistic entry awaiting confirmation.
    Local,
    /// Confirmed by the backend.
    Remote,
}

/// A message or comment as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    /// Server id, absent until confirmed.
    pub id: Option<RowId>,
    /// Author.
    pub author_id: UserId,
    /// Content.
    pub body: Body,
    /// Creation time; the client clock for local entries.
    pub created_at: DateTime<Utc>,
    /// Local or confirmed.
    pub origin: Origin,
    /// Temporary key, kept after confirmation so UI keys stay stable.
    pub local_id: Option<LocalId>,
}

impl Item {
    /// Unconfirmed item authored now.
    #[must_use]
    pub fn local(author_id: UserId, body: Body) -> Self {
        Self::local_at(author_id, body, Utc::now())
    }

    /// Unconfirmed item with an explicit creation time.
    #[must_use]
    pub const fn local_at(author_id: UserId, body: Body, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            author_id,
            body,
            created_at,
            origin: Origin::Local,
            local_id: None,
        }
    }

    /// Confirmed item for a message row. A media url wins over text.
    #[must_use]
    pub fn from_message(row: &MessageRecord) -> Self {
        let body = row
            .media_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map_or_else(|| Body::from_text(row.content.as_deref()), |url| Body::Media(MediaRef::new(url)));
        Self::confirmed(row.id, row.sender_id, body, row.created_at)
    }

    /// Confirmed item for a comment row.
    #[must_use]
    pub fn from_comment(row: &CommentRecord) -> Self {
        Self::confirmed(row.id, row.user_id, Body::from_text(Some(&row.content)), row.created_at)
    }

    /// Confirmed item for a displayable entity; likes and id-only payloads have none.
    #[must_use]
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        match entity {
            Entity::Message(row) => Some(Self::from_message(row)),
            Entity::Comment(row) => Some(Self::from_comment(row)),
            Entity::Like(_) | Entity::IdOnly { .. } => None,
        }
    }

    const fn confirmed(id: RowId, author_id: UserId, body: Body, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Some(id),
            author_id,
            body,
            created_at,
            origin: Origin::Remote,
            local_id: None,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, RowId) {
        (self.created_at, self.id.unwrap_or(RowId::MAX))
    }
}

/// What [`ReconciliationStore::apply_remote`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOutcome {
    /// New confirmed item.
    Appended,
    /// Replaced a pending local item.
    Reconciled,
    /// Changed an existing item or the like ledger.
    Updated,
    /// Removed an item or like.
    Removed,
    /// Held until history finishes loading.
    Buffered,
    /// Nothing to do.
    Ignored,
}

impl RemoteOutcome {
    /// Whether the visible state may have changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Buffered | Self::Ignored)
    }
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Ready,
    Loading(Vec<ChangeEvent>),
}

#[derive(Debug, Default)]
struct Timeline {
    confirmed: Vec<Item>,
    pending: VecDeque<Item>,
    likes: BTreeMap<RowId, UserId>,
    phase: Phase,
}

impl Timeline {
    fn position_of(&self, id: RowId) -> Option<usize> {
        self.confirmed.iter().position(|item| item.id == Some(id))
    }

    fn insert_sorted(&mut self, item: Item) {
        let key = item.sort_key();
        let at = self.confirmed.partition_point(|existing| existing.sort_key() <= key);
        self.confirmed.insert(at, item);
    }

    fn upsert_confirmed(&mut self, item: Item) -> RemoteOutcome {
        let Some(id) = item.id else {
            return RemoteOutcome::Ignored;
        };
        match self.position_of(id) {
            Some(at) => {
                let existing = self.confirmed.remove(at);
                self.insert_sorted(Item {
                    local_id: existing.local_id,
                    ..item
                });
                RemoteOutcome::Updated
            }
            None => {
                self.insert_sorted(item);
                RemoteOutcome::Appended
            }
        }
    }

    fn take_pending_match(&mut self, confirmed: &Item, window: TimeDelta) -> Option<Item> {
        let at = self.pending.iter().position(|pending| {
            pending.author_id == confirmed.author_id
                && pending.body == confirmed.body
                && (confirmed.created_at - pending.created_at).abs() <= window
        })?;
        self.pending.remove(at)
    }

    fn apply(&mut self, event: &ChangeEvent, window: TimeDelta) -> RemoteOutcome {
        if event.entity_type() == EntityType::Like {
            return self.apply_like(event);
        }

        match event.kind() {
            ChangeKind::Insert => {
                let Some(mut item) = Item::from_entity(event.entity()) else {
                    return RemoteOutcome::Ignored;
                };
                if item.id.is_some_and(|id| self.position_of(id).is_some()) {
                    return self.upsert_confirmed(item);
                }
                if let Some(pending) = self.take_pending_match(&item, window) {
                    item.local_id = pending.local_id;
                    self.insert_sorted(item);
                    counter!("feedsync_reconciled_total").increment(1);
                    return RemoteOutcome::Reconciled;
                }
                self.insert_sorted(item);
                RemoteOutcome::Appended
            }
            ChangeKind::Update => {
                let Some(item) = Item::from_entity(event.entity()) else {
                    return RemoteOutcome::Ignored;
                };
                let Some(at) = item.id.and_then(|id| self.position_of(id)) else {
                    return RemoteOutcome::Ignored;
                };
                let existing = &mut self.confirmed[at];
                existing.body = item.body;
                existing.author_id = item.author_id;
                RemoteOutcome::Updated
            }
            ChangeKind::Delete => match self.position_of(event.entity().id()) {
                Some(at) => {
                    self.confirmed.remove(at);
                    RemoteOutcome::Removed
                }
                None => RemoteOutcome::Ignored,
            },
        }
    }

    fn apply_like(&mut self, event: &ChangeEvent) -> RemoteOutcome {
        match (event.kind(), event.entity()) {
            (ChangeKind::Insert | ChangeKind::Update, Entity::Like(row)) => {
                self.likes.insert(row.id, row.user_id);
                RemoteOutcome::Updated
            }
            (ChangeKind::Delete, entity) => {
                if self.likes.remove(&entity.id()).is_some() {
                    RemoteOutcome::Removed
                } else {
                    RemoteOutcome::Ignored
                }
            }
            _ => RemoteOutcome::Ignored,
        }
    }
}

/// Per-topic item lists with optimistic reconciliation.
pub struct ReconciliationStore {
    window: TimeDelta,
    window_secs: i64,
    timelines: Mutex<HashMap<Topic, Timeline>>,
    next_local: AtomicU64,
}

impl fmt::Debug for ReconciliationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationStore")
            .field("window_secs", &self.window_secs)
            .field("topics", &lock(&self.timelines).len())
            .finish_non_exhaustive()
    }
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::from(&ReconcileSettings::default())
    }
}

impl From<&ReconcileSettings> for ReconciliationStore {
    fn from(settings: &ReconcileSettings) -> Self {
        Self::new(Duration::from_secs(settings.window_secs))
    }
}

impl ReconciliationStore {
    /// Creates a store; `window` bounds how far apart a local entry and its
    /// confirmation may be, and is the dedupe bucket width. Sub-second windows
    /// are raised to one second.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
        Self {
            window: TimeDelta::try_seconds(window_secs).unwrap_or(TimeDelta::MAX),
            window_secs,
            timelines: Mutex::new(HashMap::new()),
            next_local: AtomicU64::new(1),
        }
    }

    /// Shows `item` at the tail immediately and returns its temporary key.
    ///
    /// A second append with the same author and body in the same time bucket
    /// returns the existing key instead of adding a duplicate.
    pub fn append_local(&self, topic: Topic, item: Item) -> LocalId {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines.entry(topic).or_default();

        let bucket = self.bucket_of(item.created_at);
        if let Some(existing) = timeline.pending.iter().find(|pending| {
            pending.author_id == item.author_id
                && pending.body == item.body
                && self.bucket_of(pending.created_at) == bucket
        }) {
            if let Some(local_id) = existing.local_id {
                trace!(topic = %topic, %local_id, "duplicate local append");
                return local_id;
            }
        }

        let local_id = LocalId(self.next_local.fetch_add(1, Ordering::Relaxed));
        timeline.pending.push_back(Item {
            id: None,
            origin: Origin::Local,
            local_id: Some(local_id),
            ..item
        });
        debug!(topic = %topic, %local_id, "optimistic item appended");
        local_id
    }

    /// Applies a confirmed change, or buffers it while history is loading.
    ///
    /// Unknown topics start empty.
    pub fn apply_remote(&self, topic: Topic, event: &ChangeEvent) -> RemoteOutcome {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines.entry(topic).or_default();
        self.apply_to(timeline, topic, event)
    }

    /// Like [`Self::apply_remote`], but ignores topics the store holds nothing for.
    pub fn apply_held(&self, topic: Topic, event: &ChangeEvent) -> RemoteOutcome {
        let mut timelines = lock(&self.timelines);
        match timelines.get_mut(&topic) {
            Some(timeline) => self.apply_to(timeline, topic, event),
            None => RemoteOutcome::Ignored,
        }
    }

    fn apply_to(&self, timeline: &mut Timeline, topic: Topic, event: &ChangeEvent) -> RemoteOutcome {
        if let Phase::Loading(buffered) = &mut timeline.phase {
            buffered.push(event.clone());
            return RemoteOutcome::Buffered;
        }
        let outcome = timeline.apply(event, self.window);
        trace!(topic = %topic, ?outcome, kind = ?event.kind(), "remote change applied");
        outcome
    }

    /// Current list: confirmed items by creation time, then pending items in
    /// append order.
    #[must_use]
    pub fn snapshot(&self, topic: &Topic) -> Vec<Item> {
        lock(&self.timelines).get(topic).map_or_else(Vec::new, |timeline| {
            timeline
                .confirmed
                .iter()
                .chain(timeline.pending.iter())
                .cloned()
                .collect()
        })
    }

    /// Starts buffering live changes until [`Self::load_history`] runs.
    pub fn begin_history(&self, topic: Topic) {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines.entry(topic).or_default();
        if matches!(timeline.phase, Phase::Ready) {
            timeline.phase = Phase::Loading(Vec::new());
        }
    }

    /// Merges fetched history, then replays buffered changes in arrival order.
    /// Returns how many buffered changes were replayed.
    pub fn load_history(&self, topic: Topic, items: impl IntoIterator<Item = Item>) -> usize {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines.entry(topic).or_default();
        for item in items {
            timeline.upsert_confirmed(item);
        }

        let buffered = match std::mem::take(&mut timeline.phase) {
            Phase::Loading(buffered) => buffered,
            Phase::Ready => Vec::new(),
        };
        for event in &buffered {
            timeline.apply(event, self.window);
        }
        debug!(topic = %topic, replayed = buffered.len(), "history loaded");
        buffered.len()
    }

    /// Seeds the like ledger of a post topic.
    pub fn load_likes(&self, topic: Topic, likes: impl IntoIterator<Item = LikeRecord>) {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines.entry(topic).or_default();
        timeline
            .likes
            .extend(likes.into_iter().map(|like| (like.id, like.user_id)));
    }

    /// Drops a pending item, for example after its send failed.
    pub fn discard_local(&self, topic: &Topic, local_id: LocalId) -> bool {
        let mut timelines = lock(&self.timelines);
        let Some(timeline) = timelines.get_mut(topic) else {
            return false;
        };
        let before = timeline.pending.len();
        timeline
            .pending
            .retain(|item| item.local_id != Some(local_id));
        before != timeline.pending.len()
    }

    /// Number of pending items.
    #[must_use]
    pub fn pending_count(&self, topic: &Topic) -> usize {
        lock(&self.timelines)
            .get(topic)
            .map_or(0, |timeline| timeline.pending.len())
    }

    /// Whether live changes are currently being buffered.
    #[must_use]
    pub fn is_loading(&self, topic: &Topic) -> bool {
        lock(&self.timelines)
            .get(topic)
            .is_some_and(|timeline| matches!(timeline.phase, Phase::Loading(_)))
    }

    /// Likes currently recorded for a post topic.
    #[must_use]
    pub fn like_count(&self, topic: &Topic) -> usize {
        lock(&self.timelines)
            .get(topic)
            .map_or(0, |timeline| timeline.likes.len())
    }

    /// Whether `user` has liked the post.
    #[must_use]
    pub fn has_liked(&self, topic: &Topic, user: UserId) -> bool {
        lock(&self.timelines)
            .get(topic)
            .is_some_and(|timeline| timeline.likes.values().any(|liker| *liker == user))
    }

    /// Id of `user`'s like on the post, if any.
    #[must_use]
    pub fn like_of(&self, topic: &Topic, user: UserId) -> Option<RowId> {
        lock(&self.timelines).get(topic).and_then(|timeline| {
            timeline
                .likes
                .iter()
                .find_map(|(id, liker)| (*liker == user).then_some(*id))
        })
    }

    /// Drops all state for `topic`.
    pub fn forget(&self, topic: &Topic) {
        lock(&self.timelines).remove(topic);
    }

    /// Whether any state is held for `topic`.
    #[must_use]
    pub fn holds(&self, topic: &Topic) -> bool {
        lock(&self.timelines).contains_key(topic)
    }

    fn bucket_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(id: RowId, sender: UserId, receiver: UserId, content: &str, secs: i64) -> MessageRecord {
        MessageRecord {
            id,
            sender_id: sender,
            receiver_id: receiver,
            content: Some(content.to_string()),
            media_url: None,
            is_read: false,
            created_at: at(secs),
        }
    }

    fn event(kind: ChangeKind, entity: Entity) -> ChangeEvent {
        let topic = entity.topic().unwrap_or_else(|| Topic::post(0));
        let entity_type = match &entity {
            Entity::Comment(_) => EntityType::Comment,
            Entity::Like(_) => EntityType::Like,
            _ => EntityType::Message,
        };
        ChangeEvent::new(topic, kind, entity_type, entity, Utc::now())
    }

    fn insert(row: MessageRecord) -> ChangeEvent {
        event(ChangeKind::Insert, Entity::Message(row))
    }

    fn bodies(items: &[Item]) -> Vec<Body> {
        items.iter().map(|item| item.body.clone()).collect()
    }

    struct Pair {
        a: UserId,
        b: UserId,
        topic: Topic,
    }

    fn pair() -> Pair {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        Pair {
            a,
            b,
            topic: Topic::conversation(a, b),
        }
    }

    #[test]
    fn confirmation_replaces_the_optimistic_entry() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();

        let local_id = store.append_local(topic, Item::local_at(a, Body::text("hi"), at(0)));
        let snapshot = store.snapshot(&topic);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, Origin::Local);

        let outcome = store.apply_remote(topic, &insert(message(1, a, b, "hi", 1)));
        assert_eq!(outcome, RemoteOutcome::Reconciled);

        let snapshot = store.snapshot(&topic);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, Some(1));
        assert_eq!(snapshot[0].origin, Origin::Remote);
        assert_eq!(snapshot[0].local_id, Some(local_id));
    }

    #[test]
    fn oldest_matching_local_is_confirmed_first() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::new(Duration::from_secs(10));

        let first = store.append_local(topic, Item::local_at(a, Body::text("ok"), at(0)));
        let second = store.append_local(topic, Item::local_at(a, Body::text("ok"), at(15)));
        assert_ne!(first, second);

        store.apply_remote(topic, &insert(message(7, a, b, "ok", 2)));
        let snapshot = store.snapshot(&topic);
        assert_eq!(snapshot[0].local_id, Some(first));
        assert_eq!(snapshot[1].local_id, Some(second));
        assert_eq!(snapshot[1].origin, Origin::Local);
    }

    #[test]
    fn other_authors_and_bodies_do_not_reconcile() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();
        store.append_local(topic, Item::local_at(a, Body::text("hi"), at(0)));

        assert_eq!(
            store.apply_remote(topic, &insert(message(1, b, a, "hi", 1))),
            RemoteOutcome::Appended
        );
        assert_eq!(
            store.apply_remote(topic, &insert(message(2, a, b, "hello", 1))),
            RemoteOutcome::Appended
        );
        assert_eq!(store.pending_count(&topic), 1);
        assert_eq!(store.snapshot(&topic).len(), 3);
    }

    #[test]
    fn confirmations_outside_the_window_append() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::new(Duration::from_secs(5));
        store.append_local(topic, Item::local_at(a, Body::text("late"), at(0)));

        let outcome = store.apply_remote(topic, &insert(message(1, a, b, "late", 60)));
        assert_eq!(outcome, RemoteOutcome::Appended);
        assert_eq!(store.snapshot(&topic).len(), 2);
    }

    #[test]
    fn duplicate_local_appends_collapse_within_a_bucket() {
        let Pair { a, topic, .. } = pair();
        let store = ReconciliationStore::new(Duration::from_secs(60));

        let first = store.append_local(topic, Item::local_at(a, Body::text("tap"), at(0)));
        let again = store.append_local(topic, Item::local_at(a, Body::text("tap"), at(1)));
        assert_eq!(first, again);
        assert_eq!(store.pending_count(&topic), 1);
    }

    #[test]
    fn duplicate_server_ids_never_appear() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();
        for _ in 0..3 {
            store.apply_remote(topic, &insert(message(4, a, b, "same", 0)));
        }
        store.apply_remote(topic, &insert(message(4, a, b, "edited", 0)));

        let snapshot = store.snapshot(&topic);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].body, Body::text("edited"));
    }

    #[test]
    fn snapshot_orders_confirmed_by_creation_then_pending() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();

        store.append_local(topic, Item::local_at(a, Body::text("pending"), at(0)));
        store.apply_remote(topic, &insert(message(2, b, a, "second", 20)));
        store.apply_remote(topic, &insert(message(1, b, a, "first", 10)));

        assert_eq!(
            bodies(&store.snapshot(&topic)),
            vec![Body::text("first"), Body::text("second"), Body::text("pending")]
        );
    }

    #[test]
    fn delete_of_absent_id_is_a_no_op() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();
        store.apply_remote(topic, &insert(message(1, a, b, "keep", 0)));

        let before = store.snapshot(&topic);
        let outcome = store.apply_remote(topic, &event(ChangeKind::Delete, Entity::IdOnly { id: 99 }));
        assert_eq!(outcome, RemoteOutcome::Ignored);
        assert_eq!(store.snapshot(&topic), before);

        let outcome = store.apply_remote(topic, &event(ChangeKind::Delete, Entity::IdOnly { id: 1 }));
        assert_eq!(outcome, RemoteOutcome::Removed);
        assert!(store.snapshot(&topic).is_empty());
    }

    #[test]
    fn update_replaces_fields_in_place_and_ignores_absent_ids() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();
        store.apply_remote(topic, &insert(message(1, a, b, "one", 0)));
        store.apply_remote(topic, &insert(message(2, a, b, "two", 5)));

        let mut edited = message(1, a, b, "uno", 30);
        edited.is_read = true;
        let outcome = store.apply_remote(topic, &event(ChangeKind::Update, Entity::Message(edited)));
        assert_eq!(outcome, RemoteOutcome::Updated);

        let snapshot = store.snapshot(&topic);
        assert_eq!(bodies(&snapshot), vec![Body::text("uno"), Body::text("two")]);
        assert_eq!(snapshot[0].created_at, at(0));

        let ghost = event(ChangeKind::Update, Entity::Message(message(50, a, b, "ghost", 0)));
        assert_eq!(store.apply_remote(topic, &ghost), RemoteOutcome::Ignored);
        assert_eq!(store.snapshot(&topic).len(), 2);
    }

    #[test]
    fn changes_during_history_load_are_buffered_and_replayed() {
        let Pair { a, b, topic } = pair();
        let store = ReconciliationStore::default();
        store.begin_history(topic);
        assert!(store.is_loading(&topic));

        assert_eq!(
            store.apply_remote(topic, &insert(message(3, b, a, "live", 30))),
            RemoteOutcome::Buffered
        );
        assert_eq!(
            store.apply_remote(topic, &event(ChangeKind::Delete, Entity::IdOnly { id: 1 })),
            RemoteOutcome::Buffered
        );
        assert!(store.snapshot(&topic).is_empty());

        let history = vec![
            Item::from_message(&message(1, a, b, "old", 0)),
            Item::from_message(&message(2, b, a, "older reply", 10)),
            Item::from_message(&message(3, b, a, "live", 30)),
        ];
        assert_eq!(store.load_history(topic, history), 2);
        assert!(!store.is_loading(&topic));

        let ids: Vec<Option<RowId>> = store.snapshot(&topic).iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
    }

    #[test]
    fn discarding_a_failed_send_removes_it() {
        let Pair { a, topic, .. } = pair();
        let store = ReconciliationStore::default();
        let local_id = store.append_local(topic, Item::local(a, Body::text("oops")));

        assert!(store.discard_local(&topic, local_id));
        assert!(!store.discard_local(&topic, local_id));
        assert!(store.snapshot(&topic).is_empty());
    }

    #[test]
    fn media_messages_carry_a_media_body() {
        let Pair { a, b, .. } = pair();
        let mut row = message(1, a, b, "", 0);
        row.content = None;
        row.media_url = Some("a-b/1.webm".into());

        let item = Item::from_message(&row);
        assert!(matches!(item.body, Body::Media(ref media) if media.path == "a-b/1.webm"));
    }

    #[test]
    fn like_ledger_tracks_inserts_and_deletes() {
        let topic = Topic::post(3);
        let store = ReconciliationStore::default();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        store.load_likes(
            topic,
            vec![LikeRecord {
                id: 1,
                post_id: 3,
                user_id: other,
                created_at: at(0),
            }],
        );
        let like = LikeRecord {
            id: 2,
            post_id: 3,
            user_id: user,
            created_at: at(5),
        };
        store.apply_remote(topic, &event(ChangeKind::Insert, Entity::Like(like)));

        assert_eq!(store.like_count(&topic), 2);
        assert!(store.has_liked(&topic, user));
        assert_eq!(store.like_of(&topic, user), Some(2));
        assert!(store.snapshot(&topic).is_empty());

        let outcome = store.apply_remote(
            topic,
            &ChangeEvent::new(topic, ChangeKind::Delete, EntityType::Like, Entity::IdOnly { id: 2 }, Utc::now()),
        );
        assert_eq!(outcome, RemoteOutcome::Removed);
        assert!(!store.has_liked(&topic, user));
        assert_eq!(store.like_count(&topic), 1);
    }

    #[test]
    fn comments_become_items() {
        let topic = Topic::post(9);
        let store = ReconciliationStore::default();
        let author = Uuid::new_v4();
        store.append_local(topic, Item::local_at(author, Body::text("nice"), at(0)));

        let comment = CommentRecord {
            id: 11,
            post_id: 9,
            user_id: author,
            content: "nice".into(),
            created_at: at(2),
        };
        let outcome = store.apply_remote(topic, &event(ChangeKind::Insert, Entity::Comment(comment)));
        assert_eq!(outcome, RemoteOutcome::Reconciled);
        assert_eq!(store.snapshot(&topic)[0].id, Some(11));
    }
}
