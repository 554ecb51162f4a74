//! Runtime for the `audiobook` binary.
//!
//! Provides device listing, metadata inspection and the interactive player loop.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use audiobook_player::device;
use audiobook_player::pipeline::{CpalBackend, CpalOptions, NullBackend, RenderBackend};
use audiobook_player::{PlaybackObserver, Player};
use audiobook_types::{PlaybackState, TrackMetadata, format_clock, format_hms};
use crossbeam_channel::{Receiver, Sender, bounded, never, select, tick, unbounded};

use crate::config::{InfoConfig, PlayConfig, StartAt};
use crate::control::{self, ControlCommand};

const TICK: Duration = Duration::from_millis(200);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for dev in device::list_devices(&host)? {
        let marker = if dev.is_default { "*" } else { " " };
        match (dev.min_rate, dev.max_rate) {
            (Some(min), Some(max)) => println!("{marker} {} ({min}-{max} Hz)", dev.name),
            _ => println!("{marker} {}", dev.name),
        }
    }
    Ok(())
}

/// Print metadata for one file, optionally extracting the cover art.
pub fn run_info(config: InfoConfig) -> Result<()> {
    let meta = audiobook_player::metadata::read_metadata(&config.path)
        .with_context(|| format!("read metadata from {}", config.path.display()))?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else {
        print!("{}", describe_track(&meta));
    }

    if let Some(out) = &config.cover {
        if meta.cover_art.is_empty() {
            return Err(anyhow!("{} has no embedded cover art", config.path.display()));
        }
        std::fs::write(out, &meta.cover_art)
            .with_context(|| format!("write cover art to {}", out.display()))?;
        tracing::info!(path = %out.display(), bytes = meta.cover_art.len(), "cover art written");
    }
    Ok(())
}

/// Play one file, reading control commands from stdin until it ends or the user quits.
pub fn run_play(config: PlayConfig, install_ctrlc: bool) -> Result<()> {
    let backend: Arc<dyn RenderBackend> = if config.null_output {
        Arc::new(NullBackend::new())
    } else {
        Arc::new(CpalBackend::new(
            CpalOptions {
                device: normalize_device_name(config.device.clone()),
            },
            config.playback.clone(),
        ))
    };
    let player = Player::new(backend, config.playback.clone());

    let track = player
        .read_metadata(&config.path)
        .with_context(|| format!("read metadata from {}", config.path.display()))?;
    print!("{}", describe_track(&track));

    let start_secs = resolve_start(&track, config.start)?;

    let (end_tx, end_rx) = unbounded();
    player.set_observer(Arc::new(SessionEnd { tx: end_tx }));

    let interrupted = if install_ctrlc {
        let (tx, rx) = bounded(1);
        ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        })
        .context("install Ctrl-C handler")?;
        rx
    } else {
        never()
    };

    player.play_file(&config.path, start_secs)?;
    println!("{}", control::HELP);

    let lines = spawn_stdin_reader()?;
    let mut stdin_open = true;
    let ticker = tick(TICK);
    let mut progress = Progress::default();
    loop {
        let input = if stdin_open { lines.clone() } else { never() };
        select! {
            recv(input) -> line => match line {
                Ok(line) => {
                    if handle_line(&player, &line) == Flow::Quit {
                        break;
                    }
                }
                Err(_) => {
                    tracing::debug!("stdin closed; playing to the end");
                    stdin_open = false;
                }
            },
            recv(ticker) -> _ => {
                player.dispatch_events();
                progress.update(&player);
            },
            recv(end_rx) -> end => {
                progress.clear();
                match end {
                    Ok(Ended::Finished) => println!("finished"),
                    Ok(Ended::Failed(message)) => println!("playback stopped: {message}"),
                    Err(_) => {}
                }
                break;
            },
            recv(interrupted) -> _ => {
                progress.clear();
                tracing::info!("interrupted");
                break;
            },
        }
    }

    player.stop();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn handle_line(player: &Player, line: &str) -> Flow {
    let cmd = match control::parse_command(line) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return Flow::Continue,
        Err(e) => {
            println!("{e} (h for help)");
            return Flow::Continue;
        }
    };

    let result = match cmd {
        ControlCommand::TogglePause => {
            player.pause();
            Ok(())
        }
        ControlCommand::Resume => {
            player.resume();
            Ok(())
        }
        ControlCommand::Stop => {
            player.stop();
            println!("stopped at {}", format_clock(player.position().as_secs()));
            Ok(())
        }
        ControlCommand::Skip(offset) => player.skip(offset),
        ControlCommand::Seek(secs) => player.seek(secs),
        ControlCommand::Chapter(index) => match player.play_chapter(index) {
            Ok(true) => Ok(()),
            Ok(false) => {
                println!("no chapter {}", index + 1);
                Ok(())
            }
            Err(e) => Err(e),
        },
        ControlCommand::ListChapters => {
            match player.track() {
                Some(track) => print!("{}", describe_chapters(&track, player.current_chapter())),
                None => println!("no track"),
            }
            Ok(())
        }
        ControlCommand::Status => {
            match serde_json::to_string_pretty(&player.status()) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!("status encode failed: {e}"),
            }
            Ok(())
        }
        ControlCommand::Help => {
            println!("{}", control::HELP);
            Ok(())
        }
        ControlCommand::Quit => return Flow::Quit,
    };
    if let Err(e) = result {
        tracing::warn!("{cmd:?} failed: {e}");
        println!("error: {e}");
    }
    Flow::Continue
}

/// Forwards session ends to the control loop.
struct SessionEnd {
    tx: Sender<Ended>,
}

enum Ended {
    Finished,
    Failed(String),
}

impl PlaybackObserver for SessionEnd {
    fn on_end_of_stream(&self) {
        let _ = self.tx.send(Ended::Finished);
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(Ended::Failed(message.to_string()));
    }
}

/// Prints `HH:MM:SS / HH:MM:SS` once per second while playing.
#[derive(Default)]
struct Progress {
    last: Option<u64>,
}

impl Progress {
    fn update(&mut self, player: &Player) {
        if player.state() != PlaybackState::Playing {
            return;
        }
        let secs = player.position().as_secs();
        if self.last == Some(secs) {
            return;
        }
        self.last = Some(secs);
        let mut out = std::io::stdout().lock();
        let _ = write!(
            out,
            "\r{} / {}",
            format_clock(secs),
            format_clock(player.duration().as_secs())
        );
        let _ = out.flush();
    }

    fn clear(&mut self) {
        if self.last.take().is_some() {
            println!();
        }
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("audiobook-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(rx)
}

fn resolve_start(track: &TrackMetadata, start: StartAt) -> Result<u64> {
    match start {
        StartAt::Seconds(secs) => Ok(secs),
        StartAt::Chapter(index) => track
            .chapters
            .get(index)
            .map(|ch| ch.timestamp)
            .ok_or_else(|| {
                anyhow!(
                    "chapter {} out of range ({} chapters)",
                    index + 1,
                    track.chapters.len()
                )
            }),
    }
}

fn describe_track(meta: &TrackMetadata) -> String {
    let mut out = String::new();
    let name = meta
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let field = |value: &str| {
        if value.is_empty() {
            "-".to_string()
        } else {
            value.to_string()
        }
    };
    out.push_str(&format!("file:     {name}\n"));
    out.push_str(&format!("title:    {}\n", field(&meta.title)));
    out.push_str(&format!("artist:   {}\n", field(&meta.artist)));
    out.push_str(&format!("album:    {}\n", field(&meta.album)));
    out.push_str(&format!(
        "duration: {}\n",
        meta.duration_ms
            .map(|ms| format_clock(ms / 1000))
            .unwrap_or_else(|| "unknown".to_string())
    ));
    if let Some(rate) = meta.sample_rate {
        out.push_str(&format!("rate:     {rate} Hz\n"));
    }
    if !meta.cover_art.is_empty() {
        out.push_str(&format!(
            "cover:    {} bytes ({})\n",
            meta.cover_art.len(),
            meta.cover_art_mime.as_deref().unwrap_or("unknown type")
        ));
    }
    out.push_str(&describe_chapters(meta, None));
    out
}

fn describe_chapters(meta: &TrackMetadata, current: Option<usize>) -> String {
    if meta.chapters.is_empty() {
        return "chapters: none\n".to_string();
    }
    let mut out = format!("chapters: {}\n", meta.chapters.len());
    for (i, ch) in meta.chapters.iter().enumerate() {
        let marker = if current == Some(i) { '>' } else { ' ' };
        out.push_str(&format!(
            "{marker}{:>4}. {:>8}  {}\n",
            i + 1,
            format_hms(ch.timestamp),
            ch.display_title(i)
        ));
    }
    out
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
