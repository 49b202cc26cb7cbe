use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::topic::Topic;

/// Identifier of an authenticated user.
pub type UserId = Uuid;

/// Server-assigned row identifier.
pub type RowId = i64;

/// Identifier of a post.
pub type PostId = i64;

/// A row of the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server-assigned id.
    pub id: RowId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Text body; `None` for media messages.
    #[serde(default)]
    pub content: Option<String>,
    /// Storage path of attached media.
    #[serde(default)]
    pub media_url: Option<String>,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub is_read: bool,
    /// Creation time assigned by the backend.
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Conversation topic this message belongs to.
    #[must_use]
    pub fn topic(&self) -> Topic {
        Topic::conversation(self.sender_id, self.receiver_id)
    }
}

/// A row of the `comments` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRecord {
    /// Server-assigned id.
    pub id: RowId,
    /// Post the comment is attached to.
    pub post_id: PostId,
    /// Author of the comment.
    pub user_id: UserId,
    /// Comment text.
    pub content: String,
    /// Creation time assigned by the backend.
    pub created_at: DateTime<Utc>,
}

/// A row of the `likes` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LikeRecord {
    /// Server-assigned id.
    pub id: RowId,
    /// Liked post.
    pub post_id: PostId,
    /// User who liked the post.
    pub user_id: UserId,
    /// Creation time assigned by the backend.
    pub created_at: DateTime<Utc>,
}

/// A row of the `conversations` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRecord {
    /// Server-assigned id.
    pub id: RowId,
    /// First participant.
    pub participant1_id: UserId,
    /// Second participant.
    pub participant2_id: UserId,
    /// Time of the latest message in the conversation.
    pub last_message_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// The participant that is not `viewer`.
    #[must_use]
    pub fn other_participant(&self, viewer: UserId) -> UserId {
        if self.participant1_id == viewer {
            self.participant2_id
        } else {
            self.participant1_id
        }
    }
}

/// A row of the `profiles` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRecord {
    /// User id the profile belongs to.
    pub id: UserId,
    /// Public handle.
    #[serde(default)]
    pub username: Option<String>,
    /// Storage path of the avatar image.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileRecord {
    /// Placeholder for a user whose profile row is missing.
    #[must_use]
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            username: Some("Unknown User".to_string()),
            avatar_url: None,
        }
    }
}
