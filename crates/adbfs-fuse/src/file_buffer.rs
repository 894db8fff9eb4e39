//! The whole-file buffer behind every open path.
//!
//! One `FileBuffer` backs all the handles open on a given device path, so
//! every handle sees the same bytes. The full contents live in memory; a
//! dirty timestamp tracks divergence from the device, and writeback streams
//! the buffer out through a dedicated long-lived client.
//!
//! A single lock covers contents and dirty state, and is intentionally held
//! across writeback I/O: two handles flushing the same path concurrently
//! would otherwise race each other on the device.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::buffer::GrowableBuffer;
use crate::device_client::DeviceClient;
use crate::dirty::DirtyTimestamp;
use crate::error::{FsError, Result};
use crate::flags::OpenFlags;
use crate::log_entry::LogEntry;

/// Mode for newly created files when the caller does not specify one.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o664;

/// Passed as the requested permissions to mean "keep what the device has".
pub const DONT_SET_PERMS: u32 = 0;

/// How long a buffer may stay dirty before a write forces a flush. Long on
/// purpose: each flush pushes the entire file over adb, and flushing a file
/// that is being written continuously would thrash.
pub const DEFAULT_DIRTY_TIMEOUT: Duration = Duration::from_secs(300);

/// Called on every transition of the refcount to zero. The registry uses it
/// to drop its map entry; the count may have been re-incremented by the
/// time the callback runs, so the callee re-checks.
pub type ZeroRefHandler = Box<dyn Fn(&FileBuffer) + Send + Sync>;

pub struct FileBufferOptions {
    pub path: String,
    /// Dedicated client; open files do not borrow from the short-lived
    /// connection pool.
    pub client: Box<dyn DeviceClient>,
    /// Requested permissions, or [`DONT_SET_PERMS`].
    pub perms: u32,
    pub dirty_timeout: Duration,
    pub zero_ref_handler: Option<ZeroRefHandler>,
}

struct BufferState {
    contents: GrowableBuffer,
    dirty: DirtyTimestamp,
}

pub struct FileBuffer {
    path: String,
    client: Box<dyn DeviceClient>,
    perms: u32,
    dirty_timeout: Duration,
    zero_ref_handler: Option<ZeroRefHandler>,
    ref_count: AtomicI32,
    state: Mutex<BufferState>,
}

impl std::fmt::Debug for FileBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBuffer")
            .field("path", &self.path)
            .field("perms", &self.perms)
            .field("dirty_timeout", &self.dirty_timeout)
            .field("ref_count", &self.ref_count)
            .finish_non_exhaustive()
    }
}

impl FileBuffer {
    /// Loads or creates the buffer for `opts.path`.
    ///
    /// `flags` are the flags of the first open and only determine how the
    /// buffer initializes: CREATE on a missing path starts an empty dirty
    /// buffer (the first flush materializes the file on the device, which
    /// matters because some clients stat a newly created file before
    /// writing to it); CREATE or TRUNC on an existing path starts empty and
    /// dirty; anything else loads the contents from the device.
    pub fn new(flags: OpenFlags, opts: FileBufferOptions, log: &mut LogEntry) -> Result<FileBuffer> {
        if flags.contains(OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::APPEND)
            && !flags.can_write()
        {
            return Err(FsError::NotPermitted {
                reason: format!("flags {flags} require a writable mode"),
            });
        }

        let mut state = BufferState {
            contents: GrowableBuffer::new(),
            dirty: DirtyTimestamp::new(),
        };
        let perms;

        match opts.client.stat(&opts.path, log) {
            Err(FsError::NoEntry { .. }) if flags.contains(OpenFlags::CREATE) => {
                perms = if opts.perms == DONT_SET_PERMS {
                    DEFAULT_FILE_PERMISSIONS
                } else {
                    opts.perms
                };
                state.dirty.set();
            }
            Err(err) => return Err(err),
            Ok(entry) => {
                perms = if opts.perms == DONT_SET_PERMS {
                    entry.permissions()
                } else {
                    opts.perms
                };
                if flags.contains(OpenFlags::CREATE | OpenFlags::TRUNC) {
                    state.dirty.set();
                } else {
                    let mut reader = opts.client.open_read(&opts.path, log)?;
                    let loaded = state.contents.read_from(&mut *reader)?;
                    debug!(path = %opts.path, bytes = loaded, "loaded file into buffer");
                }
            }
        }

        Ok(FileBuffer {
            path: opts.path,
            client: opts.client,
            perms,
            dirty_timeout: opts.dirty_timeout,
            zero_ref_handler: opts.zero_ref_handler,
            ref_count: AtomicI32::new(0),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn perms(&self) -> u32 {
        self.perms
    }

    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().contents.len()
    }

    /// Snapshot of the buffered bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().contents.to_vec()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty.is_set()
    }

    /// Copies bytes at `offset` into `buf`; a short count means EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.state.lock().unwrap().contents.read_at(buf, offset)
    }

    /// Copies `data` into the buffer. Marks dirty before copying; the copy
    /// itself cannot fail.
    pub fn write_at(&self, data: &[u8], offset: u64) -> usize {
        let mut state = self.state.lock().unwrap();
        state.dirty.set();
        state.contents.write_at(data, offset)
    }

    /// Truncates or extends the buffer and marks it dirty.
    pub fn set_size(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.dirty.set();
        state.contents.resize(size as usize);
    }

    /// Writes back if dirty, otherwise reloads the buffer from the device.
    pub fn sync(&self, log: &mut LogEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.dirty.is_set() {
            self.save_locked(&mut state, log)
        } else {
            self.load_locked(&mut state, log)
        }
    }

    /// Writes back if dirty; a clean buffer is a no-op.
    pub fn flush(&self, log: &mut LogEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.dirty.is_set() {
            self.save_locked(&mut state, log)
        } else {
            Ok(())
        }
    }

    /// Writes back only when the buffer has been dirty longer than the
    /// dirty timeout. Called after every write.
    pub fn sync_if_too_dirty(&self, log: &mut LogEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.dirty.has_been_dirty_for(self.dirty_timeout) {
            debug!(path = %self.path, "dirty timeout exceeded, flushing");
            self.save_locked(&mut state, log)
        } else {
            Ok(())
        }
    }

    pub fn inc_ref_count(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the refcount. Dropping below zero is a bug in the caller.
    /// On reaching zero the zero-ref handler runs exactly once for this
    /// transition.
    pub fn dec_ref_count(&self) -> i32 {
        let new_count = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if new_count < 0 {
            panic!("refcount for {} decremented past 0", self.path);
        }
        if new_count == 0 {
            if let Some(handler) = &self.zero_ref_handler {
                handler(self);
            }
        }
        new_count
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn load_locked(&self, state: &mut BufferState, log: &mut LogEntry) -> Result<()> {
        let mut reader = self.client.open_read(&self.path, log)?;
        let loaded = state.contents.read_from(&mut *reader)?;
        state.dirty.clear();
        debug!(path = %self.path, bytes = loaded, "reloaded file from device");
        Ok(())
    }

    /// Streams the buffer to the device. The dirty flag clears only after
    /// the writer's close succeeds; any earlier failure leaves it set so
    /// the contents are flushed again later.
    fn save_locked(&self, state: &mut BufferState, log: &mut LogEntry) -> Result<()> {
        let mut writer = self
            .client
            .open_write(&self.path, self.perms, SystemTime::now(), log)?;
        state.contents.write_to(&mut *writer)?;
        writer.close()?;
        state.dirty.clear();
        debug!(path = %self.path, bytes = state.contents.len(), "wrote buffer back to device");
        Ok(())
    }
}
