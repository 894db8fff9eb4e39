//! Per-handle view of an open file.
//!
//! There is one `AdbFile` per file descriptor; all handles on the same path
//! share one [`FileBuffer`]. The handle carries the open flags and enforces
//! them: mode violations are policy denials (EPERM), not user-permission
//! failures.

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::file_buffer::FileBuffer;
use crate::flags::OpenFlags;
use crate::log_entry::LogEntry;

pub struct AdbFile {
    flags: OpenFlags,
    buffer: Arc<FileBuffer>,
}

impl std::fmt::Debug for AdbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbFile")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl AdbFile {
    pub fn new(buffer: Arc<FileBuffer>, flags: OpenFlags) -> Self {
        Self { flags, buffer }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn buffer(&self) -> &Arc<FileBuffer> {
        &self.buffer
    }

    fn start(&self, name: &str, args: String) -> LogEntry {
        LogEntry::start_file_operation(name, self.buffer.path(), args)
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut log = self.start("Read", format!("len={} off={}", buf.len(), offset));

        if !self.flags.can_read() {
            let err = FsError::NotPermitted {
                reason: "read on a write-only handle".to_string(),
            };
            log.fail(&err);
            return Err(err);
        }

        let n = self.buffer.read_at(buf, offset);
        log.set_result(format!("read {n} bytes"));
        log.record_status(0);
        Ok(n)
    }

    /// Writes into the shared buffer, then flushes if the buffer has been
    /// dirty for longer than the dirty timeout.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut log = self.start("Write", format!("len={} off={}", data.len(), offset));

        if !self.flags.can_write() {
            let err = FsError::NotPermitted {
                reason: "write on a read-only handle".to_string(),
            };
            log.fail(&err);
            return Err(err);
        }

        let n = self.buffer.write_at(data, offset);
        log.set_result(format!("wrote {n} bytes"));

        if let Err(err) = self.buffer.sync_if_too_dirty(&mut log) {
            log.fail(&err);
            return Err(err);
        }
        log.record_status(0);
        Ok(n)
    }

    /// Flush is called on every close of the descriptor, including
    /// read-only ones, so a read-only handle answers success rather than a
    /// permission error.
    pub fn flush(&self) -> Result<()> {
        let mut log = self.start("Flush", String::new());

        if !self.flags.can_write() {
            log.record_status(0);
            return Ok(());
        }

        match self.buffer.flush(&mut log) {
            Ok(()) => {
                log.record_status(0);
                Ok(())
            }
            Err(err) => {
                log.fail(&err);
                Err(err)
            }
        }
    }

    /// Writes back when dirty, reloads from the device otherwise.
    pub fn fsync(&self) -> Result<()> {
        let mut log = self.start("Fsync", String::new());
        match self.buffer.sync(&mut log) {
            Ok(()) => {
                log.record_status(0);
                Ok(())
            }
            Err(err) => {
                log.fail(&err);
                Err(err)
            }
        }
    }

    /// Resizes the buffer and syncs it to the device.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut log = self.start("Truncate", format!("size={size}"));

        if !self.flags.can_write() {
            let err = FsError::NotPermitted {
                reason: "truncate on a read-only handle".to_string(),
            };
            log.fail(&err);
            return Err(err);
        }

        self.buffer.set_size(size);
        match self.buffer.sync(&mut log) {
            Ok(()) => {
                log.record_status(0);
                Ok(())
            }
            Err(err) => {
                log.fail(&err);
                Err(err)
            }
        }
    }

    /// Drops this handle's reference. Never fails; the zero-ref handler
    /// cleans the buffer out of the registry when this was the last one.
    pub fn release(&self) {
        let mut log = self.start("Release", String::new());
        self.buffer.dec_ref_count();
        log.record_status(0);
    }
}
