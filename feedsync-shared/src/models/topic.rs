use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::records::{PostId, UserId};

/// Scope of a live feed.
///
/// Conversations are stored with their participants in ascending order, so
/// both sides of a chat derive the same topic (and the same [`Topic::key`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    /// Direct conversation between two users.
    Conversation {
        /// Lower participant id.
        low: UserId,
        /// Higher participant id.
        high: UserId,
    },
    /// Comment and like activity under a single post.
    Post {
        /// Post identifier.
        post_id: PostId,
    },
    /// Every conversation one user takes part in.
    Inbox {
        /// Owner of the inbox.
        viewer: UserId,
    },
}

impl Topic {
    /// Canonical conversation topic for a pair of participants, in any order.
    #[must_use]
    pub fn conversation(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Conversation { low: a, high: b }
        } else {
            Self::Conversation { low: b, high: a }
        }
    }

    /// Topic for a post.
    #[must_use]
    pub const fn post(post_id: PostId) -> Self {
        Self::Post { post_id }
    }

    /// Inbox topic of `viewer`.
    #[must_use]
    pub const fn inbox(viewer: UserId) -> Self {
        Self::Inbox { viewer }
    }

    /// Channel key shared by every consumer of this topic.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Conversation { low, high } => format!("chat-{low}-{high}"),
            Self::Post { post_id } => format!("post-{post_id}"),
            Self::Inbox { viewer } => format!("inbox-{viewer}"),
        }
    }

    /// Whether a feed for this topic delivers changes scoped to `other`.
    ///
    /// Inbox feeds carry every conversation of their owner.
    #[must_use]
    pub fn admits(&self, other: &Self) -> bool {
        match self {
            Self::Inbox { viewer } => self == other || other.involves(*viewer),
            _ => self == other,
        }
    }

    /// Whether `user` is a participant of this conversation topic.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        match self {
            Self::Conversation { low, high } => *low == user || *high == user,
            Self::Post { .. } | Self::Inbox { .. } => false,
        }
    }

    /// The participant that is not `viewer`, for conversation topics.
    #[must_use]
    pub fn peer_of(&self, viewer: UserId) -> Option<UserId> {
        match self {
            Self::Conversation { low, high } if *low == viewer => Some(*high),
            Self::Conversation { low, high } if *high == viewer => Some(*low),
            _ => None,
        }
    }

    /// Storage folder for media exchanged in this conversation.
    #[must_use]
    pub fn media_folder(&self) -> Option<String> {
        match self {
            Self::Conversation { low, high } => Some(format!("{low}-{high}")),
            Self::Post { .. } | Self::Inbox { .. } => None,
        }
    }

    /// Participants of a conversation topic, lowest first.
    #[must_use]
    pub const fn participants(&self) -> Option<(Uuid, Uuid)> {
        match self {
            Self::Conversation { low, high } => Some((*low, *high)),
            Self::Post { .. } | Self::Inbox { .. } => None,
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.key())
    }
}
