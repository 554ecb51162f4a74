//! Guarded access to a demultiplexed container.
//!
//! Every handle here borrows a [`DecodeLease`], so opening, seeking, reading packets and
//! decoding can only happen while the process-wide decode guard is held, and every handle
//! is dropped before the lease is released.

use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{Cue, FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::{Hint, ProbedMetadata};
use symphonia::core::units::Time;

use crate::error::ContainerError;
use crate::guard::DecodeLease;

/// Samples per compressed frame assumed when the stream does not say.
pub const DEFAULT_SAMPLES_PER_FRAME: u64 = 1024;

/// An open container, valid only while the decode lease it borrows is held.
pub struct Container<'lease> {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    probed: ProbedMetadata,
    track_id: u32,
    codec_params: CodecParameters,
    _lease: PhantomData<&'lease DecodeLease>,
}

impl<'lease> Container<'lease> {
    /// Open and probe `path`, selecting the first track with a known codec.
    pub fn open(_lease: &'lease DecodeLease, path: &Path) -> Result<Self, ContainerError> {
        let file = File::open(path).map_err(|source| ContainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(ContainerError::NoAudioTrack)?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        Ok(Self {
            path: path.to_path_buf(),
            format,
            probed: probed.metadata,
            track_id,
            codec_params,
            _lease: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec_params(&self) -> &CodecParameters {
        &self.codec_params
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.codec_params.sample_rate.filter(|r| *r > 0)
    }

    /// Total samples per channel, when the container records it.
    pub fn total_frames(&self) -> Option<u64> {
        self.codec_params.n_frames
    }

    /// Samples carried by one compressed frame, falling back to
    /// [`DEFAULT_SAMPLES_PER_FRAME`].
    pub fn samples_per_frame(&self) -> u64 {
        self.codec_params
            .max_frames_per_packet
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_SAMPLES_PER_FRAME)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        duration_ms_from_codec_params(&self.codec_params)
    }

    /// Container-level cue points (chapters, when the format reader exposes them).
    pub fn cues(&self) -> &[Cue] {
        self.format.cues()
    }

    /// Time base of the selected track as `(numer, denom)`.
    pub fn time_base(&self) -> Option<(u32, u32)> {
        self.codec_params
            .time_base
            .map(|tb| (tb.numer, tb.denom))
    }

    /// Visit every metadata revision: probe-level first, then the container's own.
    pub fn for_each_metadata(&mut self, mut f: impl FnMut(&MetadataRevision)) {
        if let Some(meta) = self.probed.get() {
            if let Some(rev) = meta.current() {
                f(rev);
            }
        }
        if let Some(rev) = self.format.metadata().current() {
            f(rev);
        }
    }

    /// Initialize a decoder context from the track's configuration.
    pub fn make_decoder(&self) -> Result<TrackDecoder<'lease>, SymphoniaError> {
        let inner = symphonia::default::get_codecs()
            .make(&self.codec_params, &DecoderOptions::default())?;
        Ok(TrackDecoder {
            inner,
            _lease: PhantomData,
        })
    }

    /// Seek so that decoding resumes at compressed frame `frame`.
    ///
    /// Returns the timestamp of the first sample the caller should keep.
    pub fn seek_to_frame(&mut self, frame: u64) -> Result<u64, SymphoniaError> {
        let rate = u64::from(self.sample_rate().unwrap_or(1));
        let sample = frame.saturating_mul(self.samples_per_frame());
        let secs = sample / rate;
        let frac = (sample % rate) as f64 / rate as f64;
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::new(secs, frac),
                track_id: Some(self.track_id),
            },
        )?;
        Ok(seeked.required_ts)
    }

    /// Next packet of the selected track, or `None` at end of stream.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, SymphoniaError> {
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => return Ok(Some(packet)),
                Ok(_) => continue,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decoder context tied to the same lease as the container it came from.
pub struct TrackDecoder<'lease> {
    inner: Box<dyn Decoder>,
    _lease: PhantomData<&'lease DecodeLease>,
}

impl TrackDecoder<'_> {
    pub fn decode(&mut self, packet: &Packet) -> Result<AudioBufferRef<'_>, SymphoniaError> {
        self.inner.decode(packet)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
pub fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 || frames == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}
