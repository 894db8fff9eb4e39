//! The device capability the filesystem is written against.
//!
//! [`DeviceClient`] is the narrow seam between the filesystem core and a
//! device: the adb-backed client, the caching wrapper, and the in-memory
//! test device all satisfy it.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use adbfs_adb::{DeviceConnection, DirEntry};
use tracing::debug;

use crate::error::{FsError, Result};
use crate::log_entry::LogEntry;

/// A writer whose contents only become durable when `close` succeeds.
pub trait DeviceWriter: Write + Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// Operations the filesystem needs from a device. Every call can fail with
/// `DeviceNotFound` when the device drops off the adb server.
pub trait DeviceClient: Send + Sync {
    fn open_read(&self, path: &str, log: &mut LogEntry) -> Result<Box<dyn Read + Send>>;

    fn open_write(
        &self,
        path: &str,
        perms: u32,
        mtime: SystemTime,
        log: &mut LogEntry,
    ) -> Result<Box<dyn DeviceWriter>>;

    fn stat(&self, path: &str, log: &mut LogEntry) -> Result<DirEntry>;

    fn list_dir_entries(&self, path: &str, log: &mut LogEntry) -> Result<Vec<DirEntry>>;

    fn run_command(&self, cmd: &str, args: &[&str]) -> Result<String>;
}

/// Produces device clients. The connection pool is seeded from this, and
/// every open file gets a dedicated client of its own.
pub type DeviceClientFactory = Arc<dyn Fn() -> Box<dyn DeviceClient> + Send + Sync>;

/// Invoked when any client call observes that the device is gone. The mount
/// supervisor registers a hook that tears the filesystem down.
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// `DeviceClient` implementation over the adb host server.
///
/// Also the one place disconnection is detected: any operation returning
/// "device not found" fires the hook before the error propagates.
pub struct AdbDeviceClient {
    device: DeviceConnection,
    disconnect_hook: Option<DisconnectHook>,
}

impl AdbDeviceClient {
    pub fn new(device: DeviceConnection, disconnect_hook: Option<DisconnectHook>) -> Self {
        Self {
            device,
            disconnect_hook,
        }
    }

    fn watch<T>(&self, result: adbfs_adb::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_device_not_found() {
                    debug!(serial = %self.device.serial(), "device not found, firing disconnect hook");
                    if let Some(hook) = &self.disconnect_hook {
                        hook();
                    }
                }
                Err(err.into())
            }
        }
    }
}

impl DeviceClient for AdbDeviceClient {
    fn open_read(&self, path: &str, _log: &mut LogEntry) -> Result<Box<dyn Read + Send>> {
        let reader = self.watch(self.device.open_read(path))?;
        Ok(Box::new(reader))
    }

    fn open_write(
        &self,
        path: &str,
        perms: u32,
        mtime: SystemTime,
        _log: &mut LogEntry,
    ) -> Result<Box<dyn DeviceWriter>> {
        let writer = self.watch(self.device.open_write(path, perms, mtime))?;
        Ok(Box::new(AdbWriter { inner: writer }))
    }

    fn stat(&self, path: &str, _log: &mut LogEntry) -> Result<DirEntry> {
        self.watch(self.device.stat(path))
    }

    fn list_dir_entries(&self, path: &str, _log: &mut LogEntry) -> Result<Vec<DirEntry>> {
        self.watch(self.device.list_dir_entries(path))
    }

    fn run_command(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.watch(self.device.run_command(cmd, args))
    }
}

struct AdbWriter {
    inner: adbfs_adb::sync::SyncWriter<std::net::TcpStream>,
}

impl Write for AdbWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl DeviceWriter for AdbWriter {
    fn close(self: Box<Self>) -> Result<()> {
        self.inner.close().map_err(FsError::from)
    }
}
