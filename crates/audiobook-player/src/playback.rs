//! CPAL output stream for the audio output backend.
//!
//! The real-time callback:
//! - outputs silence without draining while paused
//! - refills a small local buffer from the sample queue without blocking
//! - maps the stereo book stream onto the device channel layout
//! - converts `f32` to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::{PopStrategy, SampleQueue};

/// Callback wiring for one output stream.
#[derive(Clone)]
pub struct OutputOptions {
    /// Max frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    /// While `true`, the callback plays silence and leaves the queue alone.
    pub paused: Arc<AtomicBool>,
    /// Incremented by the number of queued frames actually played.
    pub played_frames: Arc<AtomicU64>,
}

/// Build (but do not start) an output stream fed from `queue`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    opts: OutputOptions,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, opts, on_error),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, opts, on_error),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, opts, on_error),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, opts, on_error),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    opts: OutputOptions,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = config.channels as usize;
    let refill_max_frames = opts.refill_max_frames.max(1);
    let queue = queue.clone();
    let local = Mutex::new(LocalBuffer {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    });
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if opts.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }

            let mut st = local.lock().unwrap_or_else(PoisonError::into_inner);
            let frames = data.len() / channels_out;
            let mut played = 0u64;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    match queue.pop(PopStrategy::NonBlocking {
                        max_frames: refill_max_frames,
                    }) {
                        Some(v) => st.src = v,
                        None => {
                            st.src.clear();
                            data[frame * channels_out..].fill(silence);
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = st.next_mapped(channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                played += 1;
            }

            if played > 0 {
                opts.played_frames.fetch_add(played, Ordering::Relaxed);
            }
        },
        on_error,
        None,
    )?;

    Ok(stream)
}

/// Samples fetched from the queue but not yet written to the device.
struct LocalBuffer {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

impl LocalBuffer {
    /// Sample for `dst_ch` of the current frame; advances after the last channel.
    ///
    /// Stereo to mono averages; device channels past the source layout repeat the last
    /// source channel.
    fn next_mapped(&mut self, dst_channels: usize, dst_ch: usize) -> f32 {
        if self.pos >= self.src.len() {
            return 0.0;
        }
        let base = self.pos;
        let get = |ch: usize| self.src.get(base + ch).copied().unwrap_or(0.0);
        let out = match (self.src_channels, dst_channels) {
            (2, 1) => 0.5 * (get(0) + get(1)),
            (src, _) => get(dst_ch.min(src.saturating_sub(1))),
        };
        if dst_ch + 1 == dst_channels {
            self.pos += self.src_channels;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(src: Vec<f32>, src_channels: usize, dst_channels: usize, frames: usize) -> Vec<f32> {
        let mut st = LocalBuffer {
            pos: 0,
            src_channels,
            src,
        };
        let mut out = Vec::new();
        for _ in 0..frames {
            for ch in 0..dst_channels {
                out.push(st.next_mapped(dst_channels, ch));
            }
        }
        out
    }

    #[test]
    fn stereo_passes_through() {
        assert_eq!(render(vec![0.1, 0.2, 0.3, 0.4], 2, 2, 2), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn stereo_downmixes_to_mono() {
        let out = render(vec![0.2, 0.4, 1.0, 0.0], 2, 1, 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn extra_device_channels_repeat_right() {
        assert_eq!(
            render(vec![0.1, 0.2], 2, 4, 1),
            vec![0.1, 0.2, 0.2, 0.2]
        );
    }

    #[test]
    fn exhausted_buffer_yields_silence() {
        assert_eq!(render(vec![0.5, 0.5], 2, 2, 2), vec![0.5, 0.5, 0.0, 0.0]);
    }
}
