//! Fixtures shared by the unit tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Scratch directory under the system temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(tag: &str) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "audiobook-{tag}-{}-{}-{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Write a 16-bit PCM WAV file holding a quiet ramp.
pub fn write_wav_fixture(path: &Path, rate: u32, channels: u16, seconds: u32) {
    let frames = rate * seconds;
    let block_align = channels * 2;
    let data_len = frames * u32::from(block_align);

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let sample = ((i % 200) as i16 - 100) * 16;
        for _ in 0..channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }

    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&out).unwrap();
}

/// Encode an ISO-BMFF box.
pub fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// Encode a version-1 Nero chapter box holding `(start_ticks, title)` entries.
pub fn chpl_box(entries: &[(u64, &str)]) -> Vec<u8> {
    let mut payload = vec![1, 0, 0, 0, 0];
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (start, title) in entries {
        payload.extend_from_slice(&start.to_be_bytes());
        payload.push(title.len() as u8);
        payload.extend_from_slice(title.as_bytes());
    }
    mp4_box(b"chpl", &payload)
}

/// Minimal `ftyp` + `moov/udta/chpl` file body.
pub fn chaptered_mp4_bytes(entries: &[(u64, &str)]) -> Vec<u8> {
    let mut out = mp4_box(b"ftyp", b"M4B \0\0\0\0M4B mp42isom");
    let udta = mp4_box(b"udta", &chpl_box(entries));
    out.extend_from_slice(&mp4_box(b"moov", &udta));
    out
}
