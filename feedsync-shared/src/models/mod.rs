pub mod media;
pub mod raw;
pub mod records;
pub mod table;
pub mod topic;

pub use media::{MediaKind, MediaRef};
pub use raw::{ChangeVerb, RawChange};
pub use records::{
    CommentRecord, ConversationRecord, LikeRecord, MessageRecord, PostId, ProfileRecord, RowId,
    UserId,
};
pub use table::Table;
pub use topic::Topic;
