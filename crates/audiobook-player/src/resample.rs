//! Sample-rate conversion stage for the audio output backend.
//!
//! Runs Rubato's sinc resampler on a background thread, converting the book's PCM rate to
//! whatever rate the output device accepted. Reads from one [`SampleQueue`] and writes to a
//! new one; closing either side ends the thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::queue::{PopStrategy, SampleQueue, capacity_for};

/// Resampler stage parameters.
#[derive(Clone, Copy, Debug)]
pub struct ResampleConfig {
    /// Input chunk size in frames.
    pub chunk_frames: usize,
    /// Output queue depth in seconds.
    pub buffer_seconds: f32,
}

/// Handle to a running resampler thread.
pub struct ResampleStage {
    pub output: Arc<SampleQueue>,
    pub join: JoinHandle<()>,
}

/// Start resampling `srcq` (at `src_rate`) to `dst_rate`.
pub fn start_resampler(
    srcq: Arc<SampleQueue>,
    src_rate: u32,
    dst_rate: u32,
    cfg: ResampleConfig,
) -> Result<ResampleStage> {
    let channels = srcq.channels();
    let output = Arc::new(SampleQueue::new(
        channels,
        capacity_for(dst_rate, channels, cfg.buffer_seconds),
    ));

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };
    let chunk = cfg.chunk_frames.max(1);
    let resampler = Async::<f32>::new_sinc(
        dst_rate as f64 / src_rate.max(1) as f64,
        1.1,
        &params,
        chunk,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| anyhow!("create resampler: {e}"))?;

    let dstq = output.clone();
    let join = thread::Builder::new()
        .name("audiobook-resample".into())
        .spawn(move || {
            run(Box::new(resampler), &srcq, &dstq, channels, chunk);
            dstq.close();
        })
        .context("spawn resampler thread")?;

    tracing::info!(src_rate, dst_rate, "resampling");
    Ok(ResampleStage { output, join })
}

fn run(
    mut resampler: Box<dyn Resampler<f32>>,
    srcq: &SampleQueue,
    dstq: &SampleQueue,
    channels: usize,
    chunk: usize,
) {
    let mut out = vec![0.0f32; channels * chunk * 3];

    // Steady state: whole chunks.
    while let Some(input) = srcq.pop(PopStrategy::BlockingExact { frames: chunk }) {
        match process(resampler.as_mut(), &input, &mut out, channels, None) {
            Ok(produced) => {
                if !dstq.push_blocking(&out[..produced]) {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("resampler process error: {e:#}");
                return;
            }
        }
    }

    // Tail: whatever is left after the source closed.
    while let Some(tail) = srcq.pop(PopStrategy::BlockingUpTo { max_frames: chunk }) {
        let frames = tail.len() / channels;
        match process(resampler.as_mut(), &tail, &mut out, channels, Some(frames)) {
            Ok(produced) if produced > 0 => {
                if !dstq.push_blocking(&out[..produced]) {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("resampler tail error: {e:#}");
                return;
            }
        }
    }
}

/// Resample one interleaved chunk into `out`; returns the number of samples produced.
fn process(
    resampler: &mut dyn Resampler<f32>,
    input: &[f32],
    out: &mut [f32],
    channels: usize,
    partial_len: Option<usize>,
) -> Result<usize> {
    let in_frames = input.len() / channels;
    let input_adapter = InterleavedSlice::new(input, channels, in_frames)
        .map_err(|e| anyhow!("input adapter: {e}"))?;
    let out_frames = out.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(out, channels, out_frames)
        .map_err(|e| anyhow!("output adapter: {e}"))?;

    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len,
    };
    let (_consumed, produced) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
        .map_err(|e| anyhow!("process chunk: {e}"))?;
    Ok(produced * channels)
}
