//! Append-only record log file.
//!
//! A single file (`records.log`) holding CRC-framed puts and tombstones.
//! Appends are serialized by the store's writer lock; durability follows the
//! configured [`FsyncPolicy`].

use crate::recovery::{self, RecoveryInfo};
use crate::record::LogRecord;
use crate::StoreError;
use bytes::Bytes;
use ember_observe::{Meter, StoreEvt, StoreKind, VizEvent};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// File name of the record log inside the store directory.
pub const LOG_FILE_NAME: &str = "records.log";

/// Fsync policy for durability vs performance tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Always fsync after every write (maximum durability, lowest performance).
    Always,
    /// Batch fsyncs within a time window.
    /// Fsyncs happen at most once per the specified duration.
    Batch(Duration),
    /// Let the OS handle fsyncing (best performance, least durability).
    Os,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Batch(Duration::from_millis(5))
    }
}

/// The open log file plus its logical size.
pub struct RecordLog {
    path: PathBuf,
    file: File,
    size: u64,
    fsync_policy: FsyncPolicy,
    last_fsync: Option<Instant>,
    meter: Arc<dyn Meter>,
    #[cfg(test)]
    pub(crate) fail_sync: bool,
}

impl RecordLog {
    /// Opens (or creates) the log in `dir`, performing recovery first.
    ///
    /// Returns the log positioned at its end, the replayed frames, and
    /// recovery information.
    pub fn open(
        dir: &Path,
        fsync_policy: FsyncPolicy,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, Vec<LogRecord>, RecoveryInfo), StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let (records, info) = recovery::recover(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let size = file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                path,
                file,
                size,
                fsync_policy,
                last_fsync: None,
                meter,
                #[cfg(test)]
                fail_sync: false,
            },
            records,
            info,
        ))
    }

    /// Appends an encoded frame, returning the offset it was written at.
    ///
    /// On a failed write or fsync the file is cut back to its previous
    /// length, so a frame the caller saw fail never replays on recovery.
    pub fn append(&mut self, frame: &[u8]) -> Result<u64, StoreError> {
        let offset = self.size;

        if let Err(e) = self.file.write_all(frame) {
            self.roll_back(offset);
            return Err(e.into());
        }

        if let Err(e) = self.apply_fsync_policy() {
            self.roll_back(offset);
            return Err(e);
        }

        self.size += frame.len() as u64;
        Ok(offset)
    }

    fn roll_back(&mut self, offset: u64) {
        if let Err(e) = self
            .file
            .set_len(offset)
            .and_then(|_| self.file.seek(SeekFrom::Start(offset)).map(|_| ()))
        {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to roll back append"
            );
        }
    }

    /// Syncs the log to disk (fsync).
    pub fn sync(&mut self) -> Result<(), StoreError> {
        let start = Instant::now();
        #[cfg(test)]
        if self.fail_sync {
            return Err(std::io::Error::other("injected sync failure").into());
        }
        self.file.sync_data()?;
        self.last_fsync = Some(start);

        self.meter.emit(VizEvent::Store(StoreEvt {
            kind: StoreKind::Fsync {
                ms: start.elapsed().as_millis() as u32,
            },
        }));

        Ok(())
    }

    /// Replaces the log contents with `frames`, atomically.
    ///
    /// Returns the new log size in bytes.
    pub fn rewrite(&mut self, frames: &[Bytes]) -> Result<u64, StoreError> {
        let total: usize = frames.iter().map(|f| f.len()).sum();
        let mut contents = Vec::with_capacity(total);
        for frame in frames {
            contents.extend_from_slice(frame);
        }

        recovery::truncate_atomically(&self.path, &contents)?;

        // The old handle points at the unlinked inode; reopen the new file.
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = file.seek(SeekFrom::End(0))?;
        self.file = file;

        Ok(self.size)
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_fsync_policy(&mut self) -> Result<(), StoreError> {
        match self.fsync_policy {
            FsyncPolicy::Always => self.sync(),
            FsyncPolicy::Batch(window) => {
                let due = match self.last_fsync {
                    None => true,
                    Some(last) => last.elapsed() >= window,
                };
                if due {
                    self.sync()
                } else {
                    Ok(())
                }
            }
            FsyncPolicy::Os => Ok(()),
        }
    }
}
