//! Chapter list extraction.
//!
//! Two sources, in order of preference:
//! - cue points exposed by the format reader (timestamps in the track time base)
//! - the Nero chapter box (`moov/udta/chpl`) that M4B audio books carry, which the
//!   ISO-MP4 reader does not surface; timestamps there are 100 ns ticks
//!
//! Timestamps are truncated to whole seconds.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use audiobook_types::Chapter;
use symphonia::core::formats::Cue;

use crate::container::Container;

/// Nero chapter timestamps count 100 ns ticks.
pub const CHPL_TICKS_PER_SECOND: u64 = 10_000_000;

const MOOV: [u8; 4] = *b"moov";
const UDTA: [u8; 4] = *b"udta";
const CHPL: [u8; 4] = *b"chpl";

/// Refuse to buffer absurd chapter boxes.
const MAX_CHPL_BYTES: u64 = 4 * 1024 * 1024;

/// Chapters for an open container. Never fails: an unreadable chapter table yields no chapters.
pub fn read_chapters(container: &Container<'_>) -> Vec<Chapter> {
    let from_cues = chapters_from_cues(container.cues(), container.time_base());
    if !from_cues.is_empty() {
        return from_cues;
    }
    match read_chpl_chapters(container.path()) {
        Ok(chapters) => chapters,
        Err(e) => {
            tracing::debug!(path = %container.path().display(), "chapter box unreadable: {e}");
            Vec::new()
        }
    }
}

fn chapters_from_cues(cues: &[Cue], time_base: Option<(u32, u32)>) -> Vec<Chapter> {
    let Some((numer, denom)) = time_base.filter(|(_, d)| *d > 0) else {
        return Vec::new();
    };
    cues.iter()
        .map(|cue| {
            let secs = cue.start_ts.saturating_mul(u64::from(numer)) / u64::from(denom);
            let title = cue
                .tags
                .first()
                .map(|tag| tag.value.to_string())
                .unwrap_or_default();
            Chapter::new(secs, title)
        })
        .collect()
}

/// Read the Nero chapter box of an MP4-family file, if present.
pub fn read_chpl_chapters(path: &Path) -> io::Result<Vec<Chapter>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let Some((start, size)) = find_box(&mut reader, 0, len, &[MOOV, UDTA, CHPL])? else {
        return Ok(Vec::new());
    };
    if size > MAX_CHPL_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("chapter box too large: {size} bytes"),
        ));
    }

    let mut payload = vec![0u8; size as usize];
    reader.seek(SeekFrom::Start(start))?;
    reader.read_exact(&mut payload)?;
    parse_chpl(&payload)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated chapter box"))
}

/// Locate the payload of the box at `path` (a chain of nested box types) within
/// `[start, end)`. Returns `(payload_offset, payload_len)`.
fn find_box<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    end: u64,
    path: &[[u8; 4]],
) -> io::Result<Option<(u64, u64)>> {
    let Some((want, rest)) = path.split_first() else {
        return Ok(None);
    };

    let mut pos = start;
    while pos + 8 <= end {
        reader.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind = [header[4], header[5], header[6], header[7]];

        let (header_len, box_len) = match size32 {
            0 => (8, end - pos),
            1 => {
                let mut large = [0u8; 8];
                reader.read_exact(&mut large)?;
                (16, u64::from_be_bytes(large))
            }
            n => (8, u64::from(n)),
        };
        if box_len < header_len || pos + box_len > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad box size {box_len} at offset {pos}"),
            ));
        }

        let payload = pos + header_len;
        let payload_end = pos + box_len;
        if kind == *want {
            if rest.is_empty() {
                return Ok(Some((payload, payload_end - payload)));
            }
            return find_box(reader, payload, payload_end, rest);
        }
        pos = payload_end;
    }
    Ok(None)
}

/// Parse a `chpl` payload (after the box header).
///
/// Layout: version (1), flags (3), then for version 1 a reserved byte and a
/// big-endian u32 count, for version 0 a u8 count; each entry is a big-endian
/// u64 start in 100 ns ticks followed by a length-prefixed UTF-8 title.
fn parse_chpl(payload: &[u8]) -> Option<Vec<Chapter>> {
    let mut cur = Cursor { buf: payload, pos: 0 };
    let version = cur.u8()?;
    cur.skip(3)?;
    let count = if version >= 1 {
        cur.skip(1)?;
        cur.u32()? as usize
    } else {
        cur.u8()? as usize
    };

    let mut chapters = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let ticks = cur.u64()?;
        let title_len = cur.u8()? as usize;
        let title = String::from_utf8_lossy(cur.take(title_len)?).into_owned();
        chapters.push(Chapter::new(ticks / CHPL_TICKS_PER_SECOND, title));
    }
    Some(chapters)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_be_bytes(raw))
    }
}
