#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! Shared models and configuration for feedsync.
//!
//! Everything here is runtime-agnostic: row records mirroring the backend
//! tables, the raw change-feed wire shape, topic keys, and the layered
//! [`config::SyncConfig`] loader.

pub mod config;
pub mod models;

pub use config::SyncConfig;
pub use models::{
    ChangeVerb, CommentRecord, ConversationRecord, LikeRecord, MediaKind, MediaRef, MessageRecord,
    PostId, ProfileRecord, RawChange, RowId, Table, Topic, UserId,
};
