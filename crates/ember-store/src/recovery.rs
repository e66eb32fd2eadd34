//! Record log recovery with corruption detection and partial-tail truncation.
//!
//! Implements a prefix-valid recovery strategy:
//! - Decodes frames from the start of the log
//! - Validates CRC32C for each frame
//! - Stops at the first partial or corrupt frame and truncates the tail

use crate::record::{LogRecord, RecordError};
use crate::StoreError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Result of log recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Number of valid frames replayed (puts and tombstones).
    pub valid_records: u64,
    /// Total bytes truncated due to corruption.
    pub bytes_truncated: u64,
    /// Byte offset just past the last valid frame.
    pub last_valid_offset: u64,
    /// Whether any corruption was detected and truncated.
    pub corruption_detected: bool,
}

/// Recovers the log at `path`.
///
/// Returns every valid frame in log order. A missing file is an empty log.
pub fn recover(path: &Path) -> Result<(Vec<LogRecord>, RecoveryInfo), StoreError> {
    let buffer = match std::fs::read(path) {
        Ok(buffer) => buffer,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), RecoveryInfo::default()));
        }
        Err(e) => return Err(e.into()),
    };

    let (records, last_valid_offset) = scan_valid_records(&buffer);
    let file_size = buffer.len() as u64;
    let bytes_truncated = file_size - last_valid_offset;

    if bytes_truncated > 0 {
        tracing::warn!(
            path = %path.display(),
            bytes_truncated,
            valid_records = records.len(),
            "Record log has a corrupt or partial tail, truncating"
        );
        truncate_atomically(path, &buffer[..last_valid_offset as usize])?;
    }

    let info = RecoveryInfo {
        valid_records: records.len() as u64,
        bytes_truncated,
        last_valid_offset,
        corruption_detected: bytes_truncated > 0,
    };

    Ok((records, info))
}

/// Scans a buffer for valid frames, returning them and the last valid offset.
///
/// Stops scanning when corruption or an incomplete frame is detected.
fn scan_valid_records(buffer: &[u8]) -> (Vec<LogRecord>, u64) {
    let mut offset = 0usize;
    let mut records = Vec::new();

    while offset < buffer.len() {
        match LogRecord::decode(&buffer[offset..]) {
            Ok((record, size)) => {
                records.push(record);
                offset += size;
            }
            Err(RecordError::Incomplete) => {
                // Torn write at the tail
                break;
            }
            Err(e) => {
                tracing::debug!(offset, error = %e, "Stopping recovery at invalid frame");
                break;
            }
        }
    }

    (records, offset as u64)
}

/// Atomically replaces `path` with `contents` using the temp file + rename pattern.
///
/// The existing file is unchanged if a crash occurs before the rename.
pub(crate) fn truncate_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let temp_path = path.with_extension("log.tmp");

    let mut temp_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    temp_file.write_all(contents)?;
    temp_file.sync_all()?;
    drop(temp_file);

    std::fs::rename(&temp_path, path)?;

    Ok(())
}
