//! High-level per-device API over the host server.

use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{AdbError, Result};
use crate::host::AdbServer;
use crate::shell::build_command_line;
use crate::sync::{RawDent, RawStat, SyncConnection, SyncReader, SyncWriter};

/// A directory entry as reported by the device's sync service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Base name for listing results, the stat'd path's base name otherwise.
    pub name: String,
    /// Raw POSIX mode bits: file type plus the 9 permission bits.
    pub mode: u32,
    pub size: u64,
    /// Seconds-resolution modification time.
    pub modified_at: SystemTime,
}

impl DirEntry {
    pub fn is_regular(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFREG as u32
    }

    pub fn is_dir(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFLNK as u32
    }

    pub fn is_fifo(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFIFO as u32
    }

    /// The 9 permission bits.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o777
    }
}

fn entry_from_raw(name: &str, raw: RawStat) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        mode: raw.mode,
        size: raw.size as u64,
        modified_at: UNIX_EPOCH + Duration::from_secs(raw.mtime as u64),
    }
}

fn entry_from_dent(dent: RawDent) -> DirEntry {
    DirEntry {
        mode: dent.mode,
        size: dent.size as u64,
        modified_at: UNIX_EPOCH + Duration::from_secs(dent.mtime as u64),
        name: dent.name,
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Address of one device behind an adb server.
///
/// The adb server handles one request per TCP connection, so every method
/// dials its own connection; the handle itself carries no live socket and
/// methods take `&self`.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    server: AdbServer,
    serial: String,
}

impl DeviceConnection {
    pub fn new(server: AdbServer, serial: impl Into<String>) -> Self {
        Self {
            server,
            serial: serial.into(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn sync(&self) -> Result<SyncConnection<TcpStream>> {
        let socket = self.server.connect_to_device(&self.serial)?;
        SyncConnection::new(socket)
    }

    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let raw = self.sync()?.stat(path)?;
        if !raw.exists() {
            return Err(AdbError::FileNoExist {
                path: path.to_string(),
            });
        }
        Ok(entry_from_raw(base_name(path), raw))
    }

    /// Lists `path`, excluding the `.` and `..` entries some devices emit.
    pub fn list_dir_entries(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dents = self.sync()?.list(path)?;
        Ok(dents
            .into_iter()
            .filter(|d| d.name != "." && d.name != "..")
            .map(entry_from_dent)
            .collect())
    }

    /// Opens `path` for reading; the returned reader streams the full file
    /// contents and reports EOF at the end.
    pub fn open_read(&self, path: &str) -> Result<SyncReader<TcpStream>> {
        self.sync()?.into_reader(path)
    }

    /// Opens `path` for writing with `mode` permission bits; `mtime` is
    /// applied when the writer is closed. The write is durable only once
    /// `close` returns Ok.
    pub fn open_write(
        &self,
        path: &str,
        mode: u32,
        mtime: SystemTime,
    ) -> Result<SyncWriter<TcpStream>> {
        let mtime_secs = mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as u32;
        self.sync()?.into_writer(path, mode & 0o777, mtime_secs)
    }

    /// Runs a shell command on the device and returns its combined output.
    /// Most Android shell commands are silent on success; callers treat any
    /// output as a failure report.
    pub fn run_command(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let line = build_command_line(cmd, args);
        let mut socket = self.server.connect_to_device(&self.serial)?;
        socket.send_request(&format!("shell:{line}"))?;
        let output = socket.read_to_end()?;
        let text = String::from_utf8_lossy(&output).into_owned();
        debug!(serial = %self.serial, command = %line, bytes = output.len(), "shell command ran");
        Ok(text)
    }
}
