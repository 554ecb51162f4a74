//! audiobook: a terminal player for chaptered audio books.
//!
//! ## Pipeline
//! 1. **Decode**: a session thread decodes the container with Symphonia into stereo s16le PCM.
//! 2. **Transport**: a bounded in-process pipe carries the PCM to the renderer.
//! 3. **Render**: the CPAL backend converts, resamples with Rubato when the device cannot
//!    run at the stream rate, and plays through the output callback.
//!
//! ## Modes
//! - `info`: print tags, duration and chapters.
//! - `play`: play a file with interactive controls on stdin.
//! - `devices`: list output devices.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use audiobook::cli::{Args, Command};
use audiobook::config::{InfoConfig, PlayConfig, PlaybackConfig, StartAt};
use audiobook::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audiobook=info,audiobook_player=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        Command::Devices => runtime::list_devices(),
        Command::Info {
            ref path,
            json,
            ref cover,
        } => runtime::run_info(InfoConfig {
            path: path.clone(),
            json,
            cover: cover.clone(),
        }),
        Command::Play {
            ref path,
            start,
            chapter,
        } => {
            let start = match chapter {
                Some(n) => StartAt::Chapter(n.saturating_sub(1) as usize),
                None => StartAt::Seconds(start.unwrap_or(0)),
            };
            runtime::run_play(
                PlayConfig {
                    path: path.clone(),
                    start,
                    device: args.device.clone(),
                    null_output: args.null_output,
                    playback: playback_config(&args),
                },
                true,
            )
        }
    }
}

fn playback_config(args: &Args) -> PlaybackConfig {
    PlaybackConfig {
        chunk_frames: args.chunk_frames,
        refill_max_frames: args.refill_max_frames,
        buffer_seconds: args.buffer_seconds,
        ..PlaybackConfig::default()
    }
}
