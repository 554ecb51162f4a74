/// Playback tuning parameters shared by the decode, transport and render stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for render queue sizing.
    pub buffer_seconds: f32,
    /// Capacity of the PCM transport, in seconds of audio.
    pub transport_buffer_seconds: f32,
    /// Sample rate assumed when no metadata has been read yet.
    pub default_sample_rate: u32,
    /// Consecutive frame decode errors tolerated before the session is failed.
    ///
    /// `None` skips bad frames forever.
    pub max_consecutive_decode_errors: Option<u32>,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            transport_buffer_seconds: 0.5,
            default_sample_rate: 44_100,
            max_consecutive_decode_errors: Some(64),
        }
    }
}

impl PlaybackConfig {
    /// Transport capacity in bytes for interleaved stereo s16 at `sample_rate`.
    pub fn transport_capacity_bytes(&self, sample_rate: u32) -> usize {
        let secs = if self.transport_buffer_seconds.is_finite() && self.transport_buffer_seconds > 0.0
        {
            self.transport_buffer_seconds
        } else {
            0.5
        };
        let frames = (sample_rate.max(1) as f32 * secs).ceil() as usize;
        frames.max(1024).saturating_mul(crate::transport::BYTES_PER_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_capacity_scales_with_rate() {
        let cfg = PlaybackConfig::default();
        assert_eq!(cfg.transport_capacity_bytes(44_100), 22_050 * 4);
        assert_eq!(cfg.transport_capacity_bytes(48_000), 24_000 * 4);
    }

    #[test]
    fn transport_capacity_falls_back_for_bad_seconds() {
        let cfg = PlaybackConfig {
            transport_buffer_seconds: f32::NAN,
            ..PlaybackConfig::default()
        };
        assert_eq!(cfg.transport_capacity_bytes(8_000), 4_000 * 4);
        assert_eq!(cfg.transport_capacity_bytes(0), 1024 * 4);
    }
}
