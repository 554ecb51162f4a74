use std::path::PathBuf;

pub use audiobook_player::config::PlaybackConfig;

#[derive(Clone, Debug)]
pub struct InfoConfig {
    pub path: PathBuf,
    pub json: bool,
    pub cover: Option<PathBuf>,
}

/// Where playback starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartAt {
    Seconds(u64),
    /// 0-based chapter index.
    Chapter(usize),
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub start: StartAt,
    pub device: Option<String>,
    pub null_output: bool,
    pub playback: PlaybackConfig,
}
