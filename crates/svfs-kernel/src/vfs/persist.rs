//! Flat image of the metadata index.
//!
//! Test-only persistence: every entry is serialized with postcard into a
//! fixed [`RECORD_SIZE`] record, in slot order, with no header and no
//! versioning. Loading reads the whole file back. Nothing here is crash
//! safe.

use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use super::error::{VfsError, VfsResult};
use super::index::{MetadataEntry, MetadataIndex};

/// Size of one serialized entry, zero padded.
pub const RECORD_SIZE: usize = 1024;

/// Encode one entry into a zero-padded record.
pub fn encode_record(entry: &MetadataEntry) -> VfsResult<[u8; RECORD_SIZE]> {
    let mut record = [0u8; RECORD_SIZE];
    postcard::to_slice(entry, &mut record)
        .map_err(|e| VfsError::other(format!("entry {} does not fit a record: {e}", entry.attr.ino)))?;
    Ok(record)
}

/// Decode one record.
pub fn decode_record(record: &[u8]) -> VfsResult<MetadataEntry> {
    postcard::from_bytes(record).map_err(|e| VfsError::corrupt(format!("bad record: {e}")))
}

/// Write the whole index to `path`.
pub fn dump(index: &MetadataIndex, path: &Path) -> VfsResult<()> {
    let entries = index.snapshot();
    let mut buf = Vec::with_capacity(entries.len() * RECORD_SIZE);
    for entry in &entries {
        buf.extend_from_slice(&encode_record(entry)?);
    }

    let mut file = fs::File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    info!(path = %path.display(), entries = entries.len(), "dumped metadata index");
    Ok(())
}

/// Read an index image written by [`dump`].
pub fn load(path: &Path) -> VfsResult<MetadataIndex> {
    let data = fs::read(path)?;
    if data.is_empty() || data.len() % RECORD_SIZE != 0 {
        return Err(VfsError::corrupt(format!(
            "{}: {} bytes is not a whole number of records",
            path.display(),
            data.len()
        )));
    }

    let entries = data
        .chunks_exact(RECORD_SIZE)
        .enumerate()
        .map(|(slot, record)| {
            let entry = decode_record(record)?;
            if entry.attr.ino as usize != slot {
                return Err(VfsError::corrupt(format!(
                    "record {slot} claims inode {}",
                    entry.attr.ino
                )));
            }
            Ok(entry)
        })
        .collect::<VfsResult<Vec<_>>>()?;

    debug!(path = %path.display(), entries = entries.len(), "loaded metadata index");
    MetadataIndex::from_entries(entries)
}
