//! Track metadata extraction.
//!
//! Opens the container under the decode guard, collects tags, cover art, chapters and
//! stream parameters, and releases everything before returning.

use std::path::Path;

use audiobook_types::TrackMetadata;
use symphonia::core::meta::{MetadataRevision, StandardTagKey, StandardVisualKey};

use crate::chapters;
use crate::container::Container;
use crate::error::MetadataError;
use crate::guard::{self, DecodeLease};

const MAX_COVER_ART_BYTES: usize = 10_000_000;

/// Read metadata for `path`, blocking until the decode guard is free.
pub fn read_metadata(path: &Path) -> Result<TrackMetadata, MetadataError> {
    let lease = guard::acquire();
    read_with_lease(&lease, path)
}

/// Like [`read_metadata`], but returns `None` instead of waiting when the guard is busy.
pub fn try_read_metadata(path: &Path) -> Option<Result<TrackMetadata, MetadataError>> {
    let lease = guard::try_acquire()?;
    Some(read_with_lease(&lease, path))
}

fn read_with_lease(lease: &DecodeLease, path: &Path) -> Result<TrackMetadata, MetadataError> {
    let mut container = Container::open(lease, path)?;

    let mut meta = TrackMetadata {
        path: path.to_path_buf(),
        ..Default::default()
    };
    container.for_each_metadata(|rev| apply_revision(&mut meta, rev));
    meta.chapters = chapters::read_chapters(&container);

    meta.sample_rate = match container.make_decoder() {
        Ok(_decoder) => container.sample_rate(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "decoder init failed while probing: {e}");
            container.sample_rate()
        }
    };
    meta.duration_ms = container.duration_ms();

    tracing::debug!(
        path = %path.display(),
        chapters = meta.chapters.len(),
        sample_rate = ?meta.sample_rate,
        duration_ms = ?meta.duration_ms,
        "metadata read"
    );
    Ok(meta)
}

/// Fill empty fields from one metadata revision; earlier revisions win.
fn apply_revision(meta: &mut TrackMetadata, rev: &MetadataRevision) {
    for tag in rev.tags() {
        let slot = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => &mut meta.title,
            Some(StandardTagKey::Artist) => &mut meta.artist,
            Some(StandardTagKey::Album) => &mut meta.album,
            _ => continue,
        };
        if slot.is_empty() {
            *slot = tag.value.to_string();
        }
    }

    if meta.cover_art.is_empty() {
        let visual = rev
            .visuals()
            .iter()
            .find(|v| v.usage == Some(StandardVisualKey::FrontCover))
            .or_else(|| rev.visuals().first());
        if let Some(visual) = visual.filter(|v| v.data.len() <= MAX_COVER_ART_BYTES) {
            meta.cover_art = visual.data.to_vec();
            meta.cover_art_mime = Some(visual.media_type.clone()).filter(|m| !m.is_empty());
        }
    }
}
