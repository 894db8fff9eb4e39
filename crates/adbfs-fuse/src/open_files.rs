//! The registry of open file buffers, one per device path.
//!
//! All handles on the same path share one [`FileBuffer`]; the registry owns
//! the per-path dedup. Construction happens inside the registry lock so the
//! membership check is atomic with insertion, which is what makes "at most
//! one live buffer per path" hold under concurrent opens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device_client::DeviceClientFactory;
use crate::error::Result;
use crate::file_buffer::{FileBuffer, FileBufferOptions, ZeroRefHandler, DEFAULT_DIRTY_TIMEOUT};
use crate::flags::OpenFlags;
use crate::log_entry::LogEntry;

pub struct OpenFilesOptions {
    /// Produces the dedicated client each new buffer owns.
    pub client_factory: DeviceClientFactory,
    pub dirty_timeout: Duration,
}

pub struct OpenFiles {
    options: OpenFilesOptions,
    buffers: Mutex<HashMap<String, Arc<FileBuffer>>>,
}

impl OpenFiles {
    pub fn new(mut options: OpenFilesOptions) -> Arc<Self> {
        if options.dirty_timeout.is_zero() {
            options.dirty_timeout = DEFAULT_DIRTY_TIMEOUT;
        }
        Arc::new(Self {
            options,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the buffer for `path` with its refcount bumped, creating and
    /// loading it if this is the first open. The matching decrement happens
    /// when the handle is released.
    pub fn get_or_load(
        self: &Arc<Self>,
        path: &str,
        flags: OpenFlags,
        perms: u32,
        log: &mut LogEntry,
    ) -> Result<Arc<FileBuffer>> {
        let mut buffers = self.buffers.lock().unwrap();

        let buffer = match buffers.get(path) {
            Some(buffer) => Arc::clone(buffer),
            None => {
                // Constructed while holding the registry lock on purpose:
                // dropping it here would let a concurrent open build a
                // second buffer for the same path.
                let registry: Weak<OpenFiles> = Arc::downgrade(self);
                let handler: ZeroRefHandler = Box::new(move |buffer: &FileBuffer| {
                    if let Some(registry) = registry.upgrade() {
                        registry.release(buffer);
                    }
                });
                let buffer = Arc::new(FileBuffer::new(
                    flags,
                    FileBufferOptions {
                        path: path.to_string(),
                        client: (self.options.client_factory)(),
                        perms,
                        dirty_timeout: self.options.dirty_timeout,
                        zero_ref_handler: Some(handler),
                    },
                    log,
                )?);
                buffers.insert(path.to_string(), Arc::clone(&buffer));
                buffer
            }
        };

        let ref_count = buffer.inc_ref_count();
        debug!(path, ref_count, "buffer acquired");
        Ok(buffer)
    }

    /// Registered as every buffer's zero-ref handler. Removes the map entry
    /// unless a concurrent `get_or_load` already re-acquired the buffer.
    fn release(&self, buffer: &FileBuffer) {
        let mut buffers = self.buffers.lock().unwrap();

        if buffer.ref_count() != 0 {
            return;
        }

        if buffer.is_dirty() {
            warn!(path = %buffer.path(), "releasing a buffer that is still dirty");
        }
        debug!(path = %buffer.path(), "releasing buffer");
        buffers.remove(buffer.path());
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_buffer::DONT_SET_PERMS;
    use crate::testing::FakeDevice;
    use std::sync::Arc;

    fn log() -> LogEntry {
        LogEntry::start_operation("test", "/")
    }

    fn registry(device: &Arc<FakeDevice>) -> Arc<OpenFiles> {
        OpenFiles::new(OpenFilesOptions {
            client_factory: device.factory(),
            dirty_timeout: DEFAULT_DIRTY_TIMEOUT,
        })
    }

    #[test]
    fn first_open_creates_a_buffer() {
        let device = FakeDevice::new();
        device.add_file("/f", b"abc", 0o644);
        let files = registry(&device);

        let buffer = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();

        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn same_path_shares_one_buffer() {
        let device = FakeDevice::new();
        device.add_file("/f", b"abc", 0o644);
        let files = registry(&device);

        let first = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        let second = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(files.len(), 1);
        assert_eq!(device.open_read_count(), 1, "file must be loaded once");
    }

    #[test]
    fn different_paths_get_different_buffers() {
        let device = FakeDevice::new();
        device.add_file("/a", b"", 0o644);
        device.add_file("/b", b"", 0o644);
        let files = registry(&device);

        let a = files
            .get_or_load("/a", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        let b = files
            .get_or_load("/b", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn failed_construction_inserts_nothing() {
        let device = FakeDevice::new();
        let files = registry(&device);

        let result = files.get_or_load("/missing", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log());

        assert!(result.is_err());
        assert!(files.is_empty());
    }

    #[test]
    fn last_release_removes_the_buffer() {
        let device = FakeDevice::new();
        device.add_file("/f", b"", 0o644);
        let files = registry(&device);

        let buffer = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        buffer.dec_ref_count();

        assert!(files.is_empty());
    }

    #[test]
    fn release_then_reopen_builds_a_fresh_buffer() {
        let device = FakeDevice::new();
        device.add_file("/f", b"abc", 0o644);
        let files = registry(&device);

        let first = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        first.dec_ref_count();

        let second = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second), "no stale reuse after release");
        assert_eq!(second.ref_count(), 1);
        assert_eq!(device.open_read_count(), 2);
    }

    #[test]
    fn intermediate_release_keeps_the_buffer() {
        let device = FakeDevice::new();
        device.add_file("/f", b"", 0o644);
        let files = registry(&device);

        let buffer = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();

        buffer.dec_ref_count();

        assert_eq!(files.len(), 1);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn get_or_load_and_release_are_symmetric() {
        let device = FakeDevice::new();
        device.add_file("/f", b"", 0o644);
        let files = registry(&device);

        let buffer = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        let before = buffer.ref_count();

        let again = files
            .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
            .unwrap();
        again.dec_ref_count();

        assert_eq!(buffer.ref_count(), before);
    }

    #[test]
    fn concurrent_open_and_release_leave_consistent_state() {
        let device = FakeDevice::new();
        device.add_file("/f", b"", 0o644);
        let files = registry(&device);

        let mut threads = Vec::new();
        for _ in 0..8 {
            let files = Arc::clone(&files);
            threads.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let buffer = files
                        .get_or_load("/f", OpenFlags::RDONLY, DONT_SET_PERMS, &mut log())
                        .unwrap();
                    buffer.dec_ref_count();
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        // Every acquire was matched by a release; nothing may linger with a
        // positive count, and nothing with a zero count may stay mapped.
        assert!(files.is_empty());
    }
}
