use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Logical tables exposed by the data platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// User profiles.
    Profiles,
    /// Published posts.
    Posts,
    /// Direct messages.
    Messages,
    /// Post likes.
    Likes,
    /// Post comments.
    Comments,
    /// Follower relationships.
    Connections,
    /// Conversation index with last activity.
    Conversations,
}

impl Table {
    /// Wire name used by the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Posts => "posts",
            Self::Messages => "messages",
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Connections => "connections",
            Self::Conversations => "conversations",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Table {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "profiles" => Ok(Self::Profiles),
            "posts" => Ok(Self::Posts),
            "messages" => Ok(Self::Messages),
            "likes" => Ok(Self::Likes),
            "comments" => Ok(Self::Comments),
            "connections" => Ok(Self::Connections),
            "conversations" => Ok(Self::Conversations),
            _ => Err("unknown table"),
        }
    }
}
