use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "audiobook", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, global = true, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, global = true, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Queue buffer target in seconds (per stage)
    #[arg(long, global = true, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Discard audio instead of opening an output device (real-time paced)
    #[arg(long, global = true)]
    pub null_output: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print tags, duration and chapters of a file
    Info {
        /// Path to audio file (M4B/M4A/MP3/FLAC/WAV)
        path: PathBuf,

        /// Print metadata as JSON
        #[arg(long)]
        json: bool,

        /// Write embedded cover art to this file
        #[arg(long)]
        cover: Option<PathBuf>,
    },

    /// Play a file with interactive controls on stdin
    Play {
        /// Path to audio file
        path: PathBuf,

        /// Start position (SS, MM:SS or HH:MM:SS)
        #[arg(long, value_parser = parse_time, conflicts_with = "chapter")]
        start: Option<u64>,

        /// Start at chapter N (1-based)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        chapter: Option<u64>,
    },

    /// List output devices
    Devices,
}

fn parse_time(raw: &str) -> Result<u64, String> {
    audiobook_types::parse_hms(raw)
        .ok_or_else(|| format!("invalid time '{raw}', expected SS, MM:SS or HH:MM:SS"))
}
