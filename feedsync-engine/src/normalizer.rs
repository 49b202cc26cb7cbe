//! # Change Event Normalizer
//!
//! Turns the backend's per-table change notifications into [`ChangeEvent`]s.
//! Malformed notifications never interrupt a feed: they are dropped, logged,
//! counted, and handed to an optional error sink.

use std::{fmt, sync::Arc};

use chrono::Utc;
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use shared::{ChangeVerb, CommentRecord, LikeRecord, MessageRecord, RawChange, RowId, Topic};
use tracing::warn;

use crate::{
    error::NormalizeError,
    event::{ChangeEvent, ChangeKind, Entity, EntityType},
};

/// Side channel receiving diagnostics for dropped notifications.
pub type ErrorSink = Arc<dyn Fn(&Topic, &NormalizeError) + Send + Sync>;

/// Normalizer bound to the topic of the feed it serves.
///
/// Id-only deletes cannot name their own topic, so they inherit the bound one.
#[derive(Clone)]
pub struct Normalizer {
    topic: Topic,
    on_error: Option<ErrorSink>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("topic", &self.topic)
            .field("has_error_sink", &self.on_error.is_some())
            .finish()
    }
}

impl Normalizer {
    /// Creates a normalizer for `topic` without an error sink.
    #[must_use]
    pub const fn new(topic: Topic) -> Self {
        Self {
            topic,
            on_error: None,
        }
    }

    /// Routes diagnostics for dropped notifications to `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.on_error = Some(sink);
        self
    }

    /// Topic this normalizer serves.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Converts one raw notification.
    ///
    /// # Errors
    /// Returns a [`NormalizeError`] when the verb or table is unknown, the row
    /// cannot be decoded, or a delete carries no id.
    pub fn normalize(
        &self,
        raw: &RawChange,
        entity_type: EntityType,
    ) -> Result<ChangeEvent, NormalizeError> {
        let verb = ChangeVerb::try_from(raw.event.as_str()).map_err(|_| {
            NormalizeError::UnknownVerb {
                verb: raw.event.clone(),
            }
        })?;

        if raw.table() != Some(entity_type.table()) {
            return Err(NormalizeError::TableMismatch {
                table: raw.table.clone(),
                expected: entity_type.as_str(),
            });
        }

        let kind = ChangeKind::from(verb);
        let entity = match kind {
            ChangeKind::Insert | ChangeKind::Update => decode_row(entity_type, &raw.new)?,
            ChangeKind::Delete => {
                let row = if is_empty_row(&raw.old) { &raw.new } else { &raw.old };
                decode_row(entity_type, row).or_else(|_| id_only(entity_type, row))?
            }
        };

        let topic = entity.topic().unwrap_or(self.topic);
        let server_timestamp = raw
            .commit_time()
            .or_else(|| entity.created_at())
            .unwrap_or_else(Utc::now);

        Ok(ChangeEvent::new(
            topic,
            kind,
            entity_type,
            entity,
            server_timestamp,
        ))
    }

    /// Converts one raw notification, reporting failures instead of returning them.
    pub fn normalize_or_report(
        &self,
        raw: &RawChange,
        entity_type: EntityType,
    ) -> Option<ChangeEvent> {
        match self.normalize(raw, entity_type) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(topic = %self.topic, table = %raw.table, error = %err, "dropping malformed change");
                counter!("feedsync_events_dropped_total", "reason" => "malformed").increment(1);
                if let Some(sink) = &self.on_error {
                    sink(&self.topic, &err);
                }
                None
            }
        }
    }
}

fn is_empty_row(row: &Value) -> bool {
    match row {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn decode_row(entity_type: EntityType, row: &Value) -> Result<Entity, NormalizeError> {
    let malformed = |err: serde_json::Error| NormalizeError::MalformedPayload {
        entity: entity_type.as_str(),
        message: err.to_string(),
    };

    match entity_type {
        EntityType::Message => MessageRecord::deserialize(row)
            .map(Entity::Message)
            .map_err(malformed),
        EntityType::Comment => CommentRecord::deserialize(row)
            .map(Entity::Comment)
            .map_err(malformed),
        EntityType::Like => LikeRecord::deserialize(row)
            .map(Entity::Like)
            .map_err(malformed),
    }
}

fn id_only(entity_type: EntityType, row: &Value) -> Result<Entity, NormalizeError> {
    let id = row.get("id").and_then(|value| match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse::<RowId>().ok(),
        _ => None,
    });

    id.map(|id| Entity::IdOnly { id })
        .ok_or(NormalizeError::MissingId {
            entity: entity_type.as_str(),
        })
}
