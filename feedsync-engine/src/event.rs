//! Normalized change events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    ChangeVerb, CommentRecord, LikeRecord, MessageRecord, RowId, Table, Topic, UserId,
};

/// Row-level mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

impl From<ChangeVerb> for ChangeKind {
    fn from(verb: ChangeVerb) -> Self {
        match verb {
            ChangeVerb::Insert => Self::Insert,
            ChangeVerb::Update => Self::Update,
            ChangeVerb::Delete => Self::Delete,
        }
    }
}

/// Logical entity carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Direct message.
    Message,
    /// Post like.
    Like,
    /// Post comment.
    Comment,
}

impl EntityType {
    /// Backend table holding this entity.
    #[must_use]
    pub const fn table(self) -> Table {
        match self {
            Self::Message => Table::Messages,
            Self::Like => Table::Likes,
            Self::Comment => Table::Comments,
        }
    }

    /// Entity type stored in `table`, if any.
    #[must_use]
    pub const fn from_table(table: Table) -> Option<Self> {
        match table {
            Table::Messages => Some(Self::Message),
            Table::Likes => Some(Self::Like),
            Table::Comments => Some(Self::Comment),
            _ => None,
        }
    }

    /// Human readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Like => "like",
            Self::Comment => "comment",
        }
    }

    /// Entity types delivered on feeds for `topic`.
    #[must_use]
    pub const fn for_topic(topic: &Topic) -> &'static [Self] {
        match topic {
            Topic::Conversation { .. } | Topic::Inbox { .. } => &[Self::Message],
            Topic::Post { .. } => &[Self::Comment, Self::Like],
        }
    }
}

/// Payload of a change event.
///
/// Deletes frequently carry only the primary key; those decode as
/// [`Entity::IdOnly`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "row", rename_all = "snake_case")]
pub enum Entity {
    /// Full message row.
    Message(MessageRecord),
    /// Full comment row.
    Comment(CommentRecord),
    /// Full like row.
    Like(LikeRecord),
    /// Only the identifier of the affected row is known.
    IdOnly {
        /// Server id of the row.
        id: RowId,
    },
}

impl Entity {
    /// Server id of the row.
    #[must_use]
    pub const fn id(&self) -> RowId {
        match self {
            Self::Message(row) => row.id,
            Self::Comment(row) => row.id,
            Self::Like(row) => row.id,
            Self::IdOnly { id } => *id,
        }
    }

    /// Author of the row, when known.
    #[must_use]
    pub const fn author(&self) -> Option<UserId> {
        match self {
            Self::Message(row) => Some(row.sender_id),
            Self::Comment(row) => Some(row.user_id),
            Self::Like(row) => Some(row.user_id),
            Self::IdOnly { .. } => None,
        }
    }

    /// Creation time of the row, when known.
    #[must_use]
    pub const fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Message(row) => Some(row.created_at),
            Self::Comment(row) => Some(row.created_at),
            Self::Like(row) => Some(row.created_at),
            Self::IdOnly { .. } => None,
        }
    }

    /// Topic implied by the row's own columns.
    #[must_use]
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::Message(row) => Some(row.topic()),
            Self::Comment(row) => Some(Topic::post(row.post_id)),
            Self::Like(row) => Some(Topic::post(row.post_id)),
            Self::IdOnly { .. } => None,
        }
    }

    /// Whether only the id is known.
    #[must_use]
    pub const fn is_id_only(&self) -> bool {
        matches!(self, Self::IdOnly { .. })
    }
}

/// Uniform change record emitted by the normalizer.
///
/// Fields are read-only; the only constructor is crate-private so every
/// event in the system has passed through [`crate::normalizer::Normalizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    topic: Topic,
    kind: ChangeKind,
    entity_type: EntityType,
    entity: Entity,
    server_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub(crate) const fn new(
        topic: Topic,
        kind: ChangeKind,
        entity_type: EntityType,
        entity: Entity,
        server_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            topic,
            kind,
            entity_type,
            entity,
            server_timestamp,
        }
    }

    /// Feed scope the event belongs to.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Mutation kind.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Entity type.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Affected row.
    #[must_use]
    pub const fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Commit time reported by the backend.
    #[must_use]
    pub const fn server_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp
    }

    /// Author of the affected row, when known.
    #[must_use]
    pub const fn author(&self) -> Option<UserId> {
        self.entity.author()
    }
}
