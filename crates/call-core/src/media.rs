use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// A captured device track. Stopping releases the device; disabling keeps
/// the device but sends silence or black frames (mute, camera off).
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

/// Tracks acquired for one call. Cloning shares the same underlying tracks.
#[derive(Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// Stops every track. Safe to call repeatedly.
    pub fn stop(&self) {
        for track in &self.tracks {
            if !track.is_stopped() {
                track.stop();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|track| track.is_stopped())
    }

    /// Enables or disables every track of `kind`; returns how many there were.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks.iter().filter(|track| track.kind() == kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        changed
    }

    /// `None` when there is no track of `kind`.
    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        let mut tracks = self.tracks.iter().filter(|track| track.kind() == kind).peekable();
        tracks.peek()?;
        Some(tracks.all(|track| track.is_enabled()))
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field(
                "tracks",
                &self
                    .tracks
                    .iter()
                    .map(|t| (t.id().to_string(), t.kind()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Camera/microphone provider. Acquisition may suspend for a long time
/// (permission prompts), so callers must not hold call state across it.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}
