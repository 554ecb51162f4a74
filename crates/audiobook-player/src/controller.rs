//! Session controller: the public playback API.
//!
//! A [`Player`] owns at most one rendering pipeline and one decoder session at a time.
//! Pipeline events arrive on an internal queue and are handled only when the control
//! context calls [`Player::dispatch_events`] or [`Player::wait_events`], so observer
//! callbacks never run inside the call that produced them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use audiobook_types::{PlaybackEndReason, PlaybackState, PlayerStatus, TrackMetadata};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::config::PlaybackConfig;
use crate::decode::DecoderSlot;
use crate::error::{MetadataError, PlayError};
use crate::metadata;
use crate::pipeline::{
    PcmFormat, RenderBackend, RenderEvents, RenderPipeline, RenderState, SessionEvent,
};
use crate::position::PositionAnchor;
use crate::transport::Transport;

/// Receives end-of-session notifications. Called at most once per session.
pub trait PlaybackObserver: Send + Sync {
    /// The track played to its end and the player stopped itself.
    fn on_end_of_stream(&self) {}

    /// A runtime failure stopped playback.
    fn on_error(&self, _message: &str) {}
}

struct EosCallback<F>(F);

impl<F> PlaybackObserver for EosCallback<F>
where
    F: Fn() + Send + Sync,
{
    fn on_end_of_stream(&self) {
        (self.0)()
    }
}

const PHASE_IDLE: u8 = 0;
const PHASE_STOPPING: u8 = 1;

/// Chaptered audio-book player.
pub struct Player {
    backend: Arc<dyn RenderBackend>,
    config: PlaybackConfig,
    phase: AtomicU8,
    session_seq: AtomicU64,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    inner: Mutex<PlayerInner>,
    tracks: Mutex<TrackCache>,
    observer: Mutex<Option<Arc<dyn PlaybackObserver>>>,
}

#[derive(Default)]
struct TrackCache {
    /// Metadata for the current path (or the only track read so far).
    now_playing: Option<TrackMetadata>,
    /// Most recent `read_metadata` result, whatever the path.
    last_read: Option<TrackMetadata>,
}

struct PlayerInner {
    state: PlaybackState,
    baseline: Duration,
    anchor: Option<PositionAnchor>,
    current_path: Option<PathBuf>,
    pipeline: Option<Box<dyn RenderPipeline>>,
    session: Option<u64>,
    decoder: DecoderSlot,
    end_reason: Option<PlaybackEndReason>,
}

impl PlayerInner {
    fn position(&self) -> Duration {
        if self.state != PlaybackState::Playing {
            return self.baseline;
        }
        let now = self.pipeline.as_ref().and_then(|p| p.clock_now());
        match (self.anchor, now) {
            (Some(anchor), Some(now)) => anchor.position_at(now),
            _ => self.baseline,
        }
    }

    fn is_active(&self) -> bool {
        self.pipeline.is_some() || self.decoder.session().is_some()
    }

    /// Pipeline first so the transport closes before the decoder is joined.
    fn teardown(&mut self, reason: PlaybackEndReason) {
        self.baseline = self.position();
        self.anchor = None;
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(RenderState::Stopped) {
                tracing::warn!("pipeline stop failed: {e:#}");
            }
        }
        if let Some(outcome) = self.decoder.stop() {
            tracing::debug!(?outcome, "decoder session stopped");
        }
        self.session = None;
        self.state = PlaybackState::Stopped;
        self.end_reason = Some(reason);
    }

    fn enter_playing(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            if let Err(e) = pipeline.set_state(RenderState::Playing) {
                tracing::warn!("pipeline resume failed: {e:#}");
            }
        }
        let baseline = self.baseline;
        self.anchor = self
            .pipeline
            .as_ref()
            .and_then(|p| p.base_time())
            .map(|instant| PositionAnchor::new(instant, baseline));
        self.state = PlaybackState::Playing;
    }
}

impl Player {
    pub fn new(backend: Arc<dyn RenderBackend>, config: PlaybackConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            backend,
            config,
            phase: AtomicU8::new(PHASE_IDLE),
            session_seq: AtomicU64::new(0),
            events_tx,
            events_rx,
            inner: Mutex::new(PlayerInner {
                state: PlaybackState::Stopped,
                baseline: Duration::ZERO,
                anchor: None,
                current_path: None,
                pipeline: None,
                session: None,
                decoder: DecoderSlot::new(),
                end_reason: None,
            }),
            tracks: Mutex::new(TrackCache::default()),
            observer: Mutex::new(None),
        }
    }

    /// Start playing `path` from `start_secs`, replacing any active session.
    pub fn play_file(&self, path: impl AsRef<Path>, start_secs: u64) -> Result<(), PlayError> {
        let path = path.as_ref();
        if self.is_shutting_down() {
            return Err(PlayError::ShuttingDown);
        }
        self.stop_session(PlaybackEndReason::Stopped, None);
        let sample_rate = self.refresh_track(path);

        let mut inner = self.lock_inner();
        inner.current_path = Some(path.to_path_buf());
        inner.baseline = Duration::from_secs(start_secs);
        inner.anchor = None;
        inner.state = PlaybackState::Stopped;

        let session = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let transport = Transport::new(self.config.transport_capacity_bytes(sample_rate));
        let events = RenderEvents::new(self.events_tx.clone(), session);
        let format = PcmFormat::stereo_s16(sample_rate);
        let mut pipeline = match self.backend.build(&transport, format, events) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(path = %path.display(), "pipeline build failed: {e:#}");
                transport.close();
                inner.end_reason = Some(PlaybackEndReason::Error);
                return Err(PlayError::Render(e));
            }
        };

        let started = inner
            .decoder
            .start(path, start_secs, transport, &self.config)
            .map(|s| s.stream_rate());
        match started {
            Ok(Some(stream_rate)) if stream_rate != sample_rate => {
                tracing::warn!(
                    stream_rate,
                    pipeline_rate = sample_rate,
                    "stream rate differs from pipeline rate; playback speed will be off"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(path = %path.display(), start_secs, "decoder start failed: {e}");
                if let Err(stop_err) = pipeline.set_state(RenderState::Stopped) {
                    tracing::warn!("pipeline stop failed: {stop_err:#}");
                }
                inner.end_reason = Some(PlaybackEndReason::Error);
                return Err(e.into());
            }
        }

        if let Err(e) = pipeline.set_state(RenderState::Playing) {
            tracing::error!(path = %path.display(), "pipeline failed to start: {e:#}");
            let _ = pipeline.set_state(RenderState::Stopped);
            let _ = inner.decoder.stop();
            inner.end_reason = Some(PlaybackEndReason::Error);
            return Err(PlayError::Render(e));
        }

        inner.pipeline = Some(pipeline);
        inner.session = Some(session);
        inner.end_reason = None;
        inner.enter_playing();
        tracing::info!(path = %path.display(), start_secs, session, sample_rate, "playback started");
        Ok(())
    }

    /// Toggle between Playing and Paused. Does nothing while Stopped.
    pub fn pause(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            PlaybackState::Stopped => tracing::debug!("pause ignored: nothing playing"),
            PlaybackState::Playing => {
                let position = inner.position();
                inner.baseline = position;
                inner.anchor = None;
                if let Some(pipeline) = inner.pipeline.as_mut() {
                    if let Err(e) = pipeline.set_state(RenderState::Paused) {
                        tracing::warn!("pipeline pause failed: {e:#}");
                    }
                }
                inner.state = PlaybackState::Paused;
                tracing::info!(position_ms = position.as_millis() as u64, "paused");
            }
            PlaybackState::Paused => {
                inner.enter_playing();
                tracing::info!(position_ms = inner.baseline.as_millis() as u64, "resumed");
            }
        }
    }

    /// Leave Paused; no effect in any other state.
    pub fn resume(&self) {
        let mut inner = self.lock_inner();
        if inner.state == PlaybackState::Paused {
            inner.enter_playing();
            tracing::info!(position_ms = inner.baseline.as_millis() as u64, "resumed");
        }
    }

    /// Stop playback and release the session. Safe to call repeatedly or concurrently.
    pub fn stop(&self) {
        if self.stop_session(PlaybackEndReason::Stopped, None) {
            tracing::info!("playback stopped");
        }
    }

    /// True while a stop is tearing the session down.
    pub fn is_shutting_down(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_STOPPING
    }

    pub fn state(&self) -> PlaybackState {
        self.lock_inner().state
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.lock_inner().current_path.clone()
    }

    /// Logical position in the track.
    pub fn position(&self) -> Duration {
        self.lock_inner().position()
    }

    /// Track duration, or zero when unknown.
    pub fn duration(&self) -> Duration {
        let inner = self.lock_inner();
        self.duration_locked(&inner)
    }

    /// Restart the current track at chapter `index`.
    ///
    /// Returns `Ok(false)` without touching playback when there is no current track or
    /// no such chapter.
    pub fn play_chapter(&self, index: usize) -> Result<bool, PlayError> {
        let target = {
            let inner = self.lock_inner();
            let Some(path) = inner.current_path.clone() else {
                return Ok(false);
            };
            self.with_current_track(Some(path.as_path()), |t| {
                t.chapters.get(index).map(|ch| ch.timestamp)
            })
            .flatten()
            .map(|ts| (path, ts))
        };
        let Some((path, timestamp)) = target else {
            tracing::debug!(index, "no such chapter");
            return Ok(false);
        };
        tracing::info!(index, timestamp, "jumping to chapter");
        self.play_file(&path, timestamp)?;
        Ok(true)
    }

    /// Restart the current track at `secs`, clamped to the known duration.
    pub fn seek(&self, secs: u64) -> Result<(), PlayError> {
        let path = self.current_path().ok_or(PlayError::NoCurrentTrack)?;
        let target = clamp_to_duration(secs, self.duration());
        self.play_file(&path, target)
    }

    /// Move by `offset_secs` from the current position.
    pub fn skip(&self, offset_secs: i64) -> Result<(), PlayError> {
        let current = self.position().as_secs();
        let target = if offset_secs < 0 {
            current.saturating_sub(offset_secs.unsigned_abs())
        } else {
            current.saturating_add(offset_secs.unsigned_abs())
        };
        self.seek(target)
    }

    /// Index of the chapter containing the current position.
    pub fn current_chapter(&self) -> Option<usize> {
        let inner = self.lock_inner();
        let position = inner.position().as_secs();
        self.with_current_track(inner.current_path.as_deref(), |t| t.chapter_at(position))
            .flatten()
    }

    /// Metadata of the current track, when known.
    pub fn track(&self) -> Option<TrackMetadata> {
        let inner = self.lock_inner();
        self.with_current_track(inner.current_path.as_deref(), TrackMetadata::clone)
    }

    pub fn status(&self) -> PlayerStatus {
        let inner = self.lock_inner();
        let position = inner.position();
        let duration = self.duration_locked(&inner);
        let chapter = self
            .with_current_track(inner.current_path.as_deref(), |t| {
                t.chapter_at(position.as_secs())
            })
            .flatten();
        PlayerStatus {
            state: inner.state,
            now_playing: inner.current_path.clone(),
            position_ms: position.as_millis() as u64,
            duration_ms: (!duration.is_zero()).then(|| duration.as_millis() as u64),
            chapter,
            sample_rate: inner.pipeline.as_ref().map(|p| p.sample_rate()),
            end_reason: inner.end_reason,
        }
    }

    /// Read and cache metadata for `path`.
    ///
    /// Blocks while a decoder session holds the decode guard; a paused session holds it
    /// indefinitely, so prefer [`Player::try_read_metadata`] while something is playing.
    pub fn read_metadata(&self, path: impl AsRef<Path>) -> Result<TrackMetadata, MetadataError> {
        let meta = metadata::read_metadata(path.as_ref())?;
        self.remember(&meta);
        Ok(meta)
    }

    /// Like [`Player::read_metadata`], but `None` when the decode guard is busy.
    pub fn try_read_metadata(
        &self,
        path: impl AsRef<Path>,
    ) -> Option<Result<TrackMetadata, MetadataError>> {
        let result = metadata::try_read_metadata(path.as_ref())?;
        if let Ok(meta) = &result {
            self.remember(meta);
        }
        Some(result)
    }

    /// Call `f` whenever a track plays to its end. Replaces any observer.
    pub fn set_eos_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.set_observer(Arc::new(EosCallback(f)));
    }

    pub fn set_observer(&self, observer: Arc<dyn PlaybackObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Handle every queued pipeline event; returns how many were taken off the queue.
    pub fn dispatch_events(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for an event, then handle everything queued.
    pub fn wait_events(&self, timeout: Duration) -> usize {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                1 + self.dispatch_events()
            }
            Err(_) => 0,
        }
    }

    fn handle_event(&self, event: SessionEvent) {
        let session = event.session();
        match event {
            SessionEvent::EndOfStream { .. } => {
                if self.stop_session(PlaybackEndReason::Eof, Some(session)) {
                    tracing::info!(session, "end of stream");
                    if let Some(observer) = self.observer() {
                        observer.on_end_of_stream();
                    }
                } else {
                    tracing::debug!(session, "ignoring end of stream for inactive session");
                }
            }
            SessionEvent::Error { message, .. } => {
                if self.stop_session(PlaybackEndReason::Error, Some(session)) {
                    tracing::error!(session, "playback stopped: {message}");
                    if let Some(observer) = self.observer() {
                        observer.on_error(&message);
                    }
                } else {
                    tracing::debug!(session, "ignoring error for inactive session: {message}");
                }
            }
        }
    }

    /// Single-flight teardown. Returns true if this call stopped an active session.
    ///
    /// With `only` set, nothing happens unless that session is the active one.
    fn stop_session(&self, reason: PlaybackEndReason, only: Option<u64>) -> bool {
        if self
            .phase
            .compare_exchange(PHASE_IDLE, PHASE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("stop already in progress");
            return false;
        }
        let stopped = {
            let mut inner = self.lock_inner();
            let matches = only.is_none_or(|id| inner.session == Some(id));
            if matches && inner.is_active() {
                inner.teardown(reason);
                true
            } else {
                false
            }
        };
        self.phase.store(PHASE_IDLE, Ordering::Release);
        stopped
    }

    /// Sample rate to open `path` at, reading its metadata if it is not cached.
    fn refresh_track(&self, path: &Path) -> u32 {
        {
            let mut tracks = self.lock_tracks();
            if tracks.now_playing.as_ref().is_none_or(|t| t.path != path) {
                let from_last_read = tracks.last_read.as_ref().filter(|t| t.path == path).cloned();
                if from_last_read.is_some() {
                    tracks.now_playing = from_last_read;
                }
            }
            if let Some(track) = tracks.now_playing.as_ref().filter(|t| t.path == path) {
                return track.sample_rate.unwrap_or(self.config.default_sample_rate);
            }
        }

        match metadata::read_metadata(path) {
            Ok(meta) => {
                let rate = meta.sample_rate.unwrap_or(self.config.default_sample_rate);
                self.lock_tracks().now_playing = Some(meta);
                rate
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    default_rate = self.config.default_sample_rate,
                    "metadata read failed, using default rate: {e}"
                );
                self.config.default_sample_rate
            }
        }
    }

    fn remember(&self, meta: &TrackMetadata) {
        let current = self.current_path();
        let mut tracks = self.lock_tracks();
        if current.as_deref().is_none_or(|p| p == meta.path) {
            tracks.now_playing = Some(meta.clone());
        }
        tracks.last_read = Some(meta.clone());
    }

    /// Run `f` on the cached track if it belongs to `current` (any track when `None`).
    fn with_current_track<R>(
        &self,
        current: Option<&Path>,
        f: impl FnOnce(&TrackMetadata) -> R,
    ) -> Option<R> {
        let tracks = self.lock_tracks();
        tracks
            .now_playing
            .as_ref()
            .filter(|t| current.is_none_or(|p| p == t.path))
            .map(f)
    }

    fn duration_locked(&self, inner: &PlayerInner) -> Duration {
        let cached = self
            .with_current_track(inner.current_path.as_deref(), |t| t.duration_ms)
            .flatten()
            .filter(|ms| *ms > 0);
        if let Some(ms) = cached {
            return Duration::from_millis(ms);
        }
        inner
            .pipeline
            .as_ref()
            .and_then(|p| p.query_duration())
            .unwrap_or_default()
    }

    fn observer(&self) -> Option<Arc<dyn PlaybackObserver>> {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tracks(&self) -> MutexGuard<'_, TrackCache> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clamp_to_duration(secs: u64, duration: Duration) -> u64 {
    if duration.is_zero() {
        secs
    } else {
        secs.min(duration.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartError;
    use crate::guard;
    use crate::pipeline::{ManualClock, NullBackend};
    use crate::testutil::{TempDir, write_wav_fixture};
    use audiobook_types::Chapter;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const RATE: u32 = 8_000;

    fn player(clock: &ManualClock) -> Player {
        let backend = NullBackend::with_clock(Arc::new(clock.clone()));
        Player::new(Arc::new(backend), PlaybackConfig::default())
    }

    fn fixture(dir: &TempDir, name: &str, seconds: u32) -> PathBuf {
        let path = dir.path().join(name);
        write_wav_fixture(&path, RATE, 2, seconds);
        path
    }

    fn seed_track(player: &Player, track: TrackMetadata) {
        player.lock_tracks().now_playing = Some(track);
    }

    fn active_session(player: &Player) -> u64 {
        player.lock_inner().session.unwrap()
    }

    fn wait_until_stopped(player: &Player) {
        for _ in 0..200 {
            player.wait_events(Duration::from_millis(25));
            if player.state() == PlaybackState::Stopped {
                return;
            }
        }
        panic!("player never stopped");
    }

    #[derive(Default)]
    struct Recorder {
        eos: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    impl PlaybackObserver for Recorder {
        fn on_end_of_stream(&self) {
            self.eos.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn position_starts_at_requested_time_and_follows_clock() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-position");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);

        player.play_file(&path, 5).unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position(), Duration::from_secs(5));

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(player.position(), Duration::from_millis(6_500));

        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.position(), Duration::from_millis(6_500));
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Stopped));
    }

    #[test]
    fn pause_twice_resumes_from_the_snapshot() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-pause");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);

        player.play_file(&path, 0).unwrap();
        clock.advance(Duration::from_secs(3));
        player.pause();
        assert_eq!(player.state(), PlaybackState::Paused);
        assert_eq!(player.position(), Duration::from_secs(3));

        clock.advance(Duration::from_secs(5));
        assert_eq!(player.position(), Duration::from_secs(3));

        player.pause();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position(), Duration::from_secs(3));
        clock.advance(Duration::from_secs(1));
        assert_eq!(player.position(), Duration::from_secs(4));
        player.stop();
    }

    #[test]
    fn pause_and_resume_are_noops_when_stopped() {
        let clock = ManualClock::new();
        let player = player(&clock);
        player.pause();
        player.resume();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.position(), Duration::ZERO);
    }

    #[test]
    fn explicit_resume_only_leaves_paused() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-resume");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);

        player.play_file(&path, 2).unwrap();
        player.resume();
        assert_eq!(player.state(), PlaybackState::Playing);
        player.pause();
        player.resume();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position(), Duration::from_secs(2));
        player.stop();
    }

    #[test]
    fn double_stop_is_a_noop() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-stop");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);

        player.play_file(&path, 0).unwrap();
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(!player.is_shutting_down());
        assert!(!player.lock_inner().is_active());
    }

    #[test]
    fn end_of_stream_stops_once_and_callback_may_stop_again() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-eos");
        let path = fixture(&dir, "short.wav", 1);
        let player = Arc::new(player(&clock));

        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&player);
        let counter = calls.clone();
        player.set_eos_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(player) = weak.upgrade() {
                assert!(!player.is_shutting_down());
                player.stop();
            }
        });

        player.play_file(&path, 0).unwrap();
        clock.advance(Duration::from_secs(2));
        wait_until_stopped(&player);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
        player.stop();
        player.dispatch_events();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_event_stops_without_end_of_stream_callback() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-error");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);
        let recorder = Arc::new(Recorder::default());
        player.set_observer(recorder.clone());

        player.play_file(&path, 0).unwrap();
        let session = active_session(&player);
        player
            .events_tx
            .send(SessionEvent::Error {
                session,
                message: "device lost".into(),
            })
            .unwrap();
        assert_eq!(player.dispatch_events(), 1);

        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
        assert_eq!(recorder.eos.load(Ordering::SeqCst), 0);
        assert_eq!(*recorder.errors.lock().unwrap(), vec!["device lost".to_string()]);
    }

    #[test]
    fn events_from_old_sessions_are_ignored() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-stale");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);
        let recorder = Arc::new(Recorder::default());
        player.set_observer(recorder.clone());

        player.play_file(&path, 0).unwrap();
        let first = active_session(&player);
        player.play_file(&path, 4).unwrap();
        assert_ne!(active_session(&player), first);

        player
            .events_tx
            .send(SessionEvent::EndOfStream { session: first })
            .unwrap();
        assert_eq!(player.dispatch_events(), 1);
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position(), Duration::from_secs(4));
        assert_eq!(recorder.eos.load(Ordering::SeqCst), 0);
        player.stop();
    }

    #[test]
    fn chapter_jumps_converge_on_chapter_timestamps() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-chapters");
        let path = fixture(&dir, "book.wav", 40);
        let player = player(&clock);
        seed_track(
            &player,
            TrackMetadata {
                path: path.clone(),
                chapters: vec![
                    Chapter::new(0, "Opening"),
                    Chapter::new(10, "Middle"),
                    Chapter::new(30, "Ending"),
                ],
                sample_rate: Some(RATE),
                duration_ms: Some(40_000),
                ..Default::default()
            },
        );

        player.play_file(&path, 0).unwrap();
        assert_eq!(player.position(), Duration::ZERO);
        assert_eq!(player.current_chapter(), Some(0));

        assert!(player.play_chapter(2).unwrap());
        assert_eq!(player.position(), Duration::from_secs(30));
        assert_eq!(player.current_chapter(), Some(2));

        player.pause();
        clock.advance(Duration::from_secs(5));
        player.pause();
        assert_eq!(player.position(), Duration::from_secs(30));

        assert!(!player.play_chapter(3).unwrap());
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position(), Duration::from_secs(30));
        player.stop();
    }

    #[test]
    fn play_chapter_without_current_track_does_nothing() {
        let clock = ManualClock::new();
        let player = player(&clock);
        assert!(!player.play_chapter(0).unwrap());
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn duration_prefers_cached_metadata_over_pipeline() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-duration");
        let path = fixture(&dir, "book.wav", 2);
        let player = player(&clock);
        assert_eq!(player.duration(), Duration::ZERO);

        let meta = player.read_metadata(&path).unwrap();
        assert_eq!(meta.duration_ms, Some(2_000));
        assert_eq!(player.duration(), Duration::from_secs(2));

        seed_track(
            &player,
            TrackMetadata {
                path: path.clone(),
                duration_ms: Some(7_000),
                sample_rate: Some(RATE),
                ..Default::default()
            },
        );
        player.play_file(&path, 0).unwrap();
        assert_eq!(player.duration(), Duration::from_secs(7));

        seed_track(
            &player,
            TrackMetadata {
                path: path.clone(),
                duration_ms: Some(0),
                sample_rate: Some(RATE),
                ..Default::default()
            },
        );
        assert_eq!(player.duration(), Duration::from_secs(2));
        player.stop();
    }

    #[test]
    fn failed_start_leaves_player_stopped() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-missing");
        let player = player(&clock);

        let err = player
            .play_file(dir.path().join("missing.m4b"), 0)
            .unwrap_err();
        assert!(matches!(err, PlayError::Decoder(StartError::Open(_))), "{err:?}");
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
        assert!(!player.lock_inner().is_active());
    }

    #[test]
    fn seek_requires_a_current_track() {
        let clock = ManualClock::new();
        let player = player(&clock);
        assert!(matches!(player.seek(10), Err(PlayError::NoCurrentTrack)));
        assert!(matches!(player.skip(30), Err(PlayError::NoCurrentTrack)));
    }

    #[test]
    fn skip_moves_relative_and_clamps_at_zero() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-skip");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);

        player.play_file(&path, 0).unwrap();
        player.skip(5).unwrap();
        assert_eq!(player.position(), Duration::from_secs(5));
        player.skip(-30).unwrap();
        assert_eq!(player.position(), Duration::ZERO);
        player.seek(12).unwrap();
        assert_eq!(player.position(), Duration::from_secs(12));
        player.stop();
    }

    #[test]
    fn clamp_to_duration_only_when_known() {
        assert_eq!(clamp_to_duration(90, Duration::ZERO), 90);
        assert_eq!(clamp_to_duration(90, Duration::from_secs(60)), 60);
        assert_eq!(clamp_to_duration(30, Duration::from_millis(60_500)), 30);
    }

    #[test]
    fn status_reports_session_snapshot() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-status");
        let path = fixture(&dir, "book.wav", 20);
        let player = player(&clock);
        seed_track(
            &player,
            TrackMetadata {
                path: path.clone(),
                chapters: vec![Chapter::new(0, ""), Chapter::new(3, "")],
                sample_rate: Some(RATE),
                duration_ms: Some(20_000),
                ..Default::default()
            },
        );

        player.play_file(&path, 4).unwrap();
        let status = player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.as_deref(), Some(path.as_path()));
        assert_eq!(status.position_ms, 4_000);
        assert_eq!(status.duration_ms, Some(20_000));
        assert_eq!(status.chapter, Some(1));
        assert_eq!(status.sample_rate, Some(RATE));
        assert_eq!(status.end_reason, None);
        assert_eq!(player.track().map(|t| t.chapters.len()), Some(2));
        player.stop();
    }

    #[test]
    fn metadata_reads_never_overlap_playback_on_the_guard() {
        let clock = ManualClock::new();
        let dir = TempDir::new("ctl-guard");
        let playing = fixture(&dir, "playing.wav", 1);
        let other = fixture(&dir, "other.wav", 1);
        let player = Arc::new(player(&clock));

        player.play_file(&playing, 0).unwrap();
        let reader = {
            let player = player.clone();
            thread::spawn(move || player.read_metadata(&other))
        };
        thread::sleep(Duration::from_millis(20));
        clock.advance(Duration::from_secs(2));

        let meta = reader.join().unwrap().unwrap();
        assert_eq!(meta.sample_rate, Some(RATE));
        assert_eq!(guard::stats().max_holders, 1);

        // A read for another path does not replace the current track.
        assert_eq!(player.track().map(|t| t.path), Some(playing.clone()));
        wait_until_stopped(&player);
    }
}
