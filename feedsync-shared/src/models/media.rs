use serde::{Deserialize, Serialize};

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "ogg"];

/// How a media attachment should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Playable video.
    Video,
}

impl MediaKind {
    /// Classifies a storage path by its extension.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let is_video = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()));
        if is_video { Self::Video } else { Self::Image }
    }
}

/// Reference to a blob held by object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    /// Path inside the bucket.
    pub path: String,
    /// Rendering hint derived from the path.
    pub kind: MediaKind,
}

impl MediaRef {
    /// Builds a reference, classifying the media from its path.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let kind = MediaKind::from_path(&path);
        Self { path, kind }
    }

    /// File extension of the referenced blob, if any.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        self.path.rsplit_once('.').map(|(_, ext)| ext)
    }
}
