//! In-memory data platform.
//!
//! Implements the three collaborator traits over JSON rows so the engine can
//! run without a hosted backend: tests, demos, and the CLI replay tool all use
//! it. Every mutation is published on the change feed as it happens, and a
//! handful of knobs inject the failures a real network produces.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{StreamExt, future};
use serde_json::{Map, Value, json};
use shared::{RawChange, Table, Topic, UserId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    aggregator::MARK_READ_PROCEDURE,
    error::{FeedError, PlatformError, StorageError},
    event::EntityType,
    lock,
    provider::{DataPlatform, Filter, FeedProvider, ObjectStorage, Query, RawFeed},
};

const FEED_CAPACITY: usize = 1024;

/// JSON-row backend living entirely in process memory.
pub struct MemoryBackend {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    next_id: AtomicI64,
    changes: broadcast::Sender<RawChange>,
    disconnect: Mutex<CancellationToken>,
    refused_opens: AtomicU32,
    fail_mutations: AtomicBool,
    fail_rpc: AtomicBool,
    feed_opens: AtomicUsize,
    feed_closes: AtomicUsize,
    rpc_log: Mutex<Vec<String>>,
    session_user: Mutex<Option<UserId>>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tables", &lock(&self.tables).len())
            .field("blobs", &lock(&self.blobs).len())
            .field("feed_opens", &self.feed_opens())
            .field("feed_closes", &self.feed_closes())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tables: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            changes,
            disconnect: Mutex::new(CancellationToken::new()),
            refused_opens: AtomicU32::new(0),
            fail_mutations: AtomicBool::new(false),
            fail_rpc: AtomicBool::new(false),
            feed_opens: AtomicUsize::new(0),
            feed_closes: AtomicUsize::new(0),
            rpc_log: Mutex::new(Vec::new()),
            session_user: Mutex::new(None),
        }
    }

    /// Authenticates procedure calls as `user`.
    pub fn sign_in(&self, user: UserId) {
        *lock(&self.session_user) = Some(user);
    }

    /// Ends the session.
    pub fn sign_out(&self) {
        *lock(&self.session_user) = None;
    }

    /// Stores rows without publishing changes, assigning ids where missing.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        let mut tables = lock(&self.tables);
        let stored = tables.entry(table).or_default();
        for row in rows {
            if let Value::Object(mut map) = row {
                self.fill_defaults(table, &mut map);
                stored.push(Value::Object(map));
            }
        }
    }

    /// Current rows of `table`.
    #[must_use]
    pub fn rows(&self, table: Table) -> Vec<Value> {
        lock(&self.tables).get(&table).cloned().unwrap_or_default()
    }

    /// Publishes `change` to open feeds without touching stored rows.
    pub fn publish(&self, change: RawChange) {
        trace!(table = %change.table, event = %change.event, "publishing change");
        // No receivers just means nobody is listening yet.
        let _ = self.changes.send(change);
    }

    /// Drops every open feed as a network failure would.
    pub fn disconnect_feeds(&self) {
        let previous = std::mem::take(&mut *lock(&self.disconnect));
        previous.cancel();
        debug!("forced feed disconnect");
    }

    /// Makes the next `count` feed opens fail.
    pub fn refuse_opens(&self, count: u32) {
        self.refused_opens.store(count, Ordering::SeqCst);
    }

    /// Makes inserts, updates, deletes, and uploads fail while set.
    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    /// Makes procedure calls fail while set.
    pub fn fail_rpc(&self, fail: bool) {
        self.fail_rpc.store(fail, Ordering::SeqCst);
    }

    /// Successful feed opens so far.
    #[must_use]
    pub fn feed_opens(&self) -> usize {
        self.feed_opens.load(Ordering::SeqCst)
    }

    /// Feed closes so far.
    #[must_use]
    pub fn feed_closes(&self) -> usize {
        self.feed_closes.load(Ordering::SeqCst)
    }

    /// Names of procedures called, in order.
    #[must_use]
    pub fn rpc_calls(&self) -> Vec<String> {
        lock(&self.rpc_log).clone()
    }

    /// Whether a blob exists.
    #[must_use]
    pub fn has_blob(&self, bucket: &str, path: &str) -> bool {
        lock(&self.blobs).contains_key(&(bucket.to_string(), path.to_string()))
    }

    fn fill_defaults(&self, table: Table, row: &mut Map<String, Value>) {
        if row.get("id").is_none_or(Value::is_null) {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            row.insert("id".into(), json!(id));
        } else if let Some(id) = row.get("id").and_then(Value::as_i64) {
            self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        }
        let now = json!(Utc::now().to_rfc3339());
        let timestamp_column = match table {
            Table::Conversations => "last_message_at",
            _ => "created_at",
        };
        if row.get(timestamp_column).is_none_or(Value::is_null) {
            row.insert(timestamp_column.into(), now);
        }
        if table == Table::Messages && !row.contains_key("is_read") {
            row.insert("is_read".into(), json!(false));
        }
    }

    fn check_mutations(&self, operation: &'static str, table: Table) -> Result<(), PlatformError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(PlatformError::failed(operation, table, "injected failure"));
        }
        Ok(())
    }

    /// Keeps the conversations table in step with message inserts.
    fn touch_conversation(&self, message: &Value) {
        let (Some(sender), Some(receiver)) = (message.get("sender_id"), message.get("receiver_id"))
        else {
            return;
        };
        let at = message.get("created_at").cloned().unwrap_or(Value::Null);
        let pair = Filter::or(vec![
            Filter::and(vec![
                Filter::Eq("participant1_id".into(), sender.clone()),
                Filter::Eq("participant2_id".into(), receiver.clone()),
            ]),
            Filter::and(vec![
                Filter::Eq("participant1_id".into(), receiver.clone()),
                Filter::Eq("participant2_id".into(), sender.clone()),
            ]),
        ]);

        let mut tables = lock(&self.tables);
        let conversations = tables.entry(Table::Conversations).or_default();
        if let Some(existing) = conversations.iter_mut().find(|row| pair.matches(row)) {
            if let Some(map) = existing.as_object_mut() {
                map.insert("last_message_at".into(), at);
            }
        } else {
            let mut row = Map::new();
            row.insert("participant1_id".into(), sender.clone());
            row.insert("participant2_id".into(), receiver.clone());
            row.insert("last_message_at".into(), at);
            self.fill_defaults(Table::Conversations, &mut row);
            conversations.push(Value::Object(row));
        }
    }

    fn mark_read_for(&self, args: &Value) -> Result<Value, PlatformError> {
        let viewer = (*lock(&self.session_user))
            .ok_or_else(|| PlatformError::rpc(MARK_READ_PROCEDURE, "not authenticated"))?;
        let sender = args
            .get("sender_id_param")
            .cloned()
            .ok_or_else(|| PlatformError::rpc(MARK_READ_PROCEDURE, "missing sender_id_param"))?;

        let filter = Filter::and(vec![
            Filter::Eq("sender_id".into(), sender),
            Filter::eq("receiver_id", viewer.to_string()),
            Filter::eq("is_read", false),
        ]);
        Ok(json!(self.apply_update(Table::Messages, &filter, &json!({ "is_read": true }))))
    }

    fn apply_update(&self, table: Table, filter: &Filter, changes: &Value) -> u64 {
        let mut published = Vec::new();
        {
            let mut tables = lock(&self.tables);
            for row in tables.entry(table).or_default().iter_mut() {
                if !filter.matches(row) {
                    continue;
                }
                let old = row.clone();
                if let (Some(target), Some(patch)) = (row.as_object_mut(), changes.as_object()) {
                    for (column, value) in patch {
                        target.insert(column.clone(), value.clone());
                    }
                }
                published.push(RawChange::update(table, old, row.clone()));
            }
        }
        let count = published.len() as u64;
        for change in published {
            self.publish(change);
        }
        count
    }
}

#[async_trait]
impl FeedProvider for MemoryBackend {
    async fn open(&self, topic: &Topic, entities: &[EntityType]) -> Result<RawFeed, FeedError> {
        let refused = self
            .refused_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(FeedError::open_failed(topic, "injected refusal"));
        }

        self.feed_opens.fetch_add(1, Ordering::SeqCst);
        let tables: Vec<&'static str> = entities.iter().map(|entity| entity.table().as_str()).collect();
        let disconnected = lock(&self.disconnect).clone();
        debug!(topic = %topic, ?tables, "memory feed opened");

        let feed = BroadcastStream::new(self.changes.subscribe())
            .take_until(disconnected.cancelled_owned())
            .filter_map(move |received| {
                future::ready(match received {
                    Ok(change) if tables.contains(&change.table.as_str()) => Some(Ok(change)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(
                        FeedError::disconnected(format!("feed lagged by {skipped} changes")),
                    )),
                })
            });
        Ok(Box::pin(feed))
    }

    async fn close(&self, topic: &Topic) {
        self.feed_closes.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %topic, "memory feed closed");
    }
}

#[async_trait]
impl DataPlatform for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, PlatformError> {
        let mut rows: Vec<Value> = lock(&self.tables)
            .get(&query.table)
            .map(|rows| rows.iter().filter(|row| query.filter.matches(row)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = &query.order {
            rows.sort_by(|left, right| order.compare(left, right));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn count(&self, query: &Query) -> Result<u64, PlatformError> {
        let count = lock(&self.tables).get(&query.table).map_or(0, |rows| {
            rows.iter().filter(|row| query.filter.matches(row)).count()
        });
        Ok(count as u64)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, PlatformError> {
        self.check_mutations("insert", table)?;
        let Value::Object(mut map) = row else {
            return Err(PlatformError::failed("insert", table, "row must be a JSON object"));
        };
        self.fill_defaults(table, &mut map);
        let stored = Value::Object(map);

        lock(&self.tables).entry(table).or_default().push(stored.clone());
        if table == Table::Messages {
            self.touch_conversation(&stored);
        }
        self.publish(RawChange::insert(table, stored.clone()));
        Ok(stored)
    }

    async fn update(&self, table: Table, filter: &Filter, changes: Value) -> Result<u64, PlatformError> {
        self.check_mutations("update", table)?;
        Ok(self.apply_update(table, filter, &changes))
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, PlatformError> {
        self.check_mutations("delete", table)?;
        let removed: Vec<Value> = {
            let mut tables = lock(&self.tables);
            let rows = tables.entry(table).or_default();
            let (removed, kept) = std::mem::take(rows)
                .into_iter()
                .partition(|row| filter.matches(row));
            *rows = kept;
            removed
        };

        // Deletes only carry the primary key, like a default replica identity.
        for row in &removed {
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            self.publish(RawChange::delete(table, json!({ "id": id })));
        }
        Ok(removed.len() as u64)
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, PlatformError> {
        lock(&self.rpc_log).push(name.to_string());
        if self.fail_rpc.load(Ordering::SeqCst) {
            return Err(PlatformError::rpc(name, "injected failure"));
        }
        match name {
            MARK_READ_PROCEDURE => self.mark_read_for(&args),
            _ => Err(PlatformError::rpc(name, "unknown procedure")),
        }
    }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(StorageError::Failed {
                operation: "upload",
                bucket: bucket.to_string(),
                message: "injected failure".to_string(),
            });
        }
        lock(&self.blobs).insert((bucket.to_string(), path.to_string()), bytes);
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        lock(&self.blobs)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(StorageError::Failed {
                operation: "remove",
                bucket: bucket.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let mut blobs = lock(&self.blobs);
        for path in paths {
            blobs.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::select_as;
    use shared::MessageRecord;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[tokio::test]
    async fn insert_assigns_ids_and_publishes() {
        let backend = MemoryBackend::new();
        let mut feed = backend
            .open(&Topic::post(1), &[EntityType::Comment])
            .await
            .unwrap();

        let user = Uuid::new_v4();
        let stored = backend
            .insert(Table::Comments, json!({ "post_id": 1, "user_id": user, "content": "first" }))
            .await
            .unwrap();
        backend
            .insert(Table::Likes, json!({ "post_id": 1, "user_id": user }))
            .await
            .unwrap();

        assert_eq!(stored["id"], json!(1));
        assert!(stored.get("created_at").is_some());

        let change = timeout(Duration::from_secs(1), feed.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(change.table, "comments");
        assert_eq!(change.new["content"], "first");
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let backend = MemoryBackend::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![
                json!({ "sender_id": a, "receiver_id": b, "content": "2", "created_at": "2025-01-02T00:00:00Z" }),
                json!({ "sender_id": b, "receiver_id": a, "content": "1", "created_at": "2025-01-01T00:00:00Z" }),
                json!({ "sender_id": a, "receiver_id": Uuid::new_v4(), "content": "x", "created_at": "2025-01-03T00:00:00Z" }),
            ],
        );

        let pair = Filter::or(vec![
            Filter::and(vec![Filter::eq("sender_id", a.to_string()), Filter::eq("receiver_id", b.to_string())]),
            Filter::and(vec![Filter::eq("sender_id", b.to_string()), Filter::eq("receiver_id", a.to_string())]),
        ]);
        let query = Query::from(Table::Messages).filter(pair).order_by("created_at", true);
        let rows: Vec<MessageRecord> = select_as(&backend, &query).await.unwrap();
        let contents: Vec<&str> = rows.iter().filter_map(|row| row.content.as_deref()).collect();
        assert_eq!(contents, vec!["1", "2"]);

        assert_eq!(backend.count(&Query::from(Table::Messages)).await.unwrap(), 3);
        assert_eq!(
            backend.select(&Query::from(Table::Messages).limit(1)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn deletes_publish_only_the_id() {
        let backend = MemoryBackend::new();
        backend.seed(Table::Likes, vec![json!({ "id": 7, "post_id": 1, "user_id": Uuid::new_v4() })]);
        let mut feed = backend.open(&Topic::post(1), &[EntityType::Like]).await.unwrap();

        let removed = backend.delete(Table::Likes, &Filter::eq("id", 7)).await.unwrap();
        assert_eq!(removed, 1);

        let change = timeout(Duration::from_secs(1), feed.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(change.event, "DELETE");
        assert_eq!(change.old, json!({ "id": 7 }));
        assert!(backend.rows(Table::Likes).is_empty());
    }

    #[tokio::test]
    async fn message_inserts_maintain_conversations() {
        let backend = MemoryBackend::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for content in ["hi", "again"] {
            backend
                .insert(Table::Messages, json!({ "sender_id": a, "receiver_id": b, "content": content }))
                .await
                .unwrap();
        }
        backend
            .insert(Table::Messages, json!({ "sender_id": b, "receiver_id": a, "content": "back" }))
            .await
            .unwrap();

        assert_eq!(backend.rows(Table::Conversations).len(), 1);
    }

    #[tokio::test]
    async fn mark_read_procedure_flags_peer_messages() {
        let backend = MemoryBackend::new();
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        backend.seed(
            Table::Messages,
            vec![
                json!({ "sender_id": peer, "receiver_id": viewer, "content": "1" }),
                json!({ "sender_id": peer, "receiver_id": viewer, "content": "2" }),
                json!({ "sender_id": viewer, "receiver_id": peer, "content": "mine" }),
            ],
        );

        let args = json!({ "sender_id_param": peer });
        assert!(backend.rpc(MARK_READ_PROCEDURE, args.clone()).await.is_err());

        backend.sign_in(viewer);
        assert_eq!(backend.rpc(MARK_READ_PROCEDURE, args).await.unwrap(), json!(2));
        let unread = backend
            .count(&Query::from(Table::Messages).filter(Filter::eq("is_read", false)))
            .await
            .unwrap();
        assert_eq!(unread, 1);
        assert!(backend.rpc("nope", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn forced_disconnect_ends_open_feeds_only() {
        let backend = MemoryBackend::new();
        let mut before = backend.open(&Topic::post(1), &[EntityType::Comment]).await.unwrap();
        backend.disconnect_feeds();
        assert!(timeout(Duration::from_secs(1), before.next()).await.unwrap().is_none());

        let mut after = backend.open(&Topic::post(1), &[EntityType::Comment]).await.unwrap();
        backend.publish(RawChange::insert(Table::Comments, json!({ "id": 1 })));
        assert!(timeout(Duration::from_secs(1), after.next()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn injected_failures() {
        let backend = MemoryBackend::new();
        backend.refuse_opens(1);
        assert!(backend.open(&Topic::post(1), &[EntityType::Like]).await.is_err());
        assert!(backend.open(&Topic::post(1), &[EntityType::Like]).await.is_ok());
        assert_eq!(backend.feed_opens(), 1);

        backend.fail_mutations(true);
        assert!(backend.insert(Table::Likes, json!({})).await.is_err());
        assert!(backend.upload("chat-media", "a.png", vec![1]).await.is_err());
        backend.fail_mutations(false);

        backend.upload("chat-media", "a.png", vec![1, 2]).await.unwrap();
        assert_eq!(backend.download("chat-media", "a.png").await.unwrap(), vec![1, 2]);
        backend.remove("chat-media", &["a.png".to_string()]).await.unwrap();
        assert!(matches!(
            backend.download("chat-media", "a.png").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
