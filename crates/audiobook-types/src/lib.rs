use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Named timestamp marker inside a track.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
    /// Chapter start in whole seconds from the beginning of the track.
    pub timestamp: u64,
    /// Chapter title as stored in the container; may be empty.
    pub title: String,
}

impl Chapter {
    pub fn new(timestamp: u64, title: impl Into<String>) -> Self {
        Self {
            timestamp,
            title: title.into(),
        }
    }

    /// Title to show for the chapter at `index` (0-based), falling back to a positional label.
    pub fn display_title(&self, index: usize) -> String {
        if self.title.trim().is_empty() {
            format!("Chapter {}", index + 1)
        } else {
            self.title.clone()
        }
    }
}

/// Metadata extracted from a container.
///
/// Re-derived on every metadata read; never patched in place.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    /// Path identity of the track.
    pub path: PathBuf,
    /// Track title (empty if absent).
    pub title: String,
    /// Track artist (empty if absent).
    pub artist: String,
    /// Album name (empty if absent).
    pub album: String,
    /// Embedded cover art bytes (empty if absent). Not serialized.
    #[serde(skip)]
    pub cover_art: Vec<u8>,
    /// Media type of the cover art, if any.
    pub cover_art_mime: Option<String>,
    /// Chapters in container order.
    pub chapters: Vec<Chapter>,
    /// Sample rate discovered from the stream configuration.
    pub sample_rate: Option<u32>,
    /// Total duration in milliseconds, `None` when it cannot be derived.
    pub duration_ms: Option<u64>,
}

impl TrackMetadata {
    /// Index of the chapter containing `position_secs`, if any.
    ///
    /// This is the last chapter whose timestamp is `<= position_secs`.
    pub fn chapter_at(&self, position_secs: u64) -> Option<usize> {
        self.chapters
            .iter()
            .rposition(|ch| ch.timestamp <= position_secs)
    }
}

/// Playback state of the session controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Reason why the last playback session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder, transport, or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Point-in-time snapshot of the player.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    /// Path of the current (or last played) track.
    pub now_playing: Option<PathBuf>,
    /// Current position in milliseconds.
    pub position_ms: u64,
    /// Total duration in milliseconds, `None` when unknown.
    pub duration_ms: Option<u64>,
    /// Index of the chapter containing the current position.
    pub chapter: Option<usize>,
    /// Sample rate the rendering pipeline was negotiated at.
    pub sample_rate: Option<u32>,
    /// End reason of the last finished session.
    pub end_reason: Option<PlaybackEndReason>,
}

/// Format whole seconds as `H:MM:SS`, or `M:SS` below one hour.
pub fn format_hms(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Format whole seconds as zero-padded `HH:MM:SS`.
pub fn format_clock(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` into whole seconds.
pub fn parse_hms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    let mut total = 0u64;
    for (i, part) in parts.iter().enumerate() {
        let value = part.trim().parse::<u64>().ok()?;
        if i > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}
