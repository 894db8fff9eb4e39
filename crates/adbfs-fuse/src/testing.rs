//! An in-memory device for tests.
//!
//! [`FakeDevice`] holds a file tree, scripted shell outputs, and per-call
//! counters; [`FakeDeviceClient`] exposes it through the [`DeviceClient`]
//! seam. Both unit tests and the end-to-end scenario tests drive the
//! filesystem against it.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use adbfs_adb::DirEntry;

use crate::device_client::{DeviceClient, DeviceClientFactory, DeviceWriter};
use crate::error::{FsError, Result};
use crate::log_entry::LogEntry;
use crate::paths::{base_name, parent_dir};

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub mode: u32,
    pub mtime: SystemTime,
    pub contents: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    stats: AtomicUsize,
    lists: AtomicUsize,
    open_reads: AtomicUsize,
    open_writes: AtomicUsize,
}

/// Shared state behind every [`FakeDeviceClient`] produced from it.
pub struct FakeDevice {
    files: Mutex<BTreeMap<String, FakeFile>>,
    shell_outputs: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
    writebacks: Mutex<Vec<(String, Vec<u8>)>>,
    counters: Counters,
    disconnected: AtomicBool,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        let device = Arc::new(Self {
            files: Mutex::new(BTreeMap::new()),
            shell_outputs: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            writebacks: Mutex::new(Vec::new()),
            counters: Counters::default(),
            disconnected: AtomicBool::new(false),
        });
        device.add_dir("/", 0o755);
        device
    }

    pub fn add_file(&self, path: &str, contents: &[u8], perms: u32) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            FakeFile {
                mode: libc::S_IFREG as u32 | (perms & 0o777),
                mtime: SystemTime::now(),
                contents: contents.to_vec(),
            },
        );
    }

    pub fn add_dir(&self, path: &str, perms: u32) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            FakeFile {
                mode: libc::S_IFDIR as u32 | (perms & 0o777),
                mtime: SystemTime::now(),
                contents: Vec::new(),
            },
        );
    }

    /// Registers a symlink: a stat'able entry plus a scripted `readlink`
    /// answer for it.
    pub fn add_symlink(&self, path: &str, target: &str) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            FakeFile {
                mode: libc::S_IFLNK as u32 | 0o777,
                mtime: SystemTime::now(),
                contents: target.as_bytes().to_vec(),
            },
        );
        self.set_shell_output(&format!("readlink {path}"), &format!("{target}\r\n"));
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    /// Scripts the output of a shell command line ("cmd arg ..."). Unknown
    /// command lines produce empty output, which callers read as success.
    pub fn set_shell_output(&self, line: &str, output: &str) {
        self.shell_outputs
            .lock()
            .unwrap()
            .insert(line.to_string(), output.to_string());
    }

    /// Makes every subsequent call fail as if the device unplugged.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    pub fn client(self: &Arc<Self>) -> FakeDeviceClient {
        FakeDeviceClient {
            device: Arc::clone(self),
        }
    }

    pub fn factory(self: &Arc<Self>) -> DeviceClientFactory {
        let device = Arc::clone(self);
        Arc::new(move || Box::new(device.client()))
    }

    pub fn stat_count(&self) -> usize {
        self.counters.stats.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.counters.lists.load(Ordering::SeqCst)
    }

    pub fn open_read_count(&self) -> usize {
        self.counters.open_reads.load(Ordering::SeqCst)
    }

    pub fn open_write_count(&self) -> usize {
        self.counters.open_writes.load(Ordering::SeqCst)
    }

    /// Every shell command line that has been run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Every completed writeback as (path, contents), in order.
    pub fn writebacks(&self) -> Vec<(String, Vec<u8>)> {
        self.writebacks.lock().unwrap().clone()
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|f| f.contents.clone())
    }

    fn check_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(FsError::DeviceNotFound)
        } else {
            Ok(())
        }
    }

    fn entry_for(&self, path: &str, file: &FakeFile) -> DirEntry {
        DirEntry {
            name: base_name(path).to_string(),
            mode: file.mode,
            size: file.contents.len() as u64,
            modified_at: file.mtime,
        }
    }
}

/// A [`DeviceClient`] over a shared [`FakeDevice`].
pub struct FakeDeviceClient {
    device: Arc<FakeDevice>,
}

impl DeviceClient for FakeDeviceClient {
    fn open_read(&self, path: &str, _log: &mut LogEntry) -> Result<Box<dyn Read + Send>> {
        self.device.check_connected()?;
        self.device.counters.open_reads.fetch_add(1, Ordering::SeqCst);
        let files = self.device.files.lock().unwrap();
        match files.get(path) {
            Some(file) => Ok(Box::new(Cursor::new(file.contents.clone()))),
            None => Err(FsError::NoEntry {
                path: path.to_string(),
            }),
        }
    }

    fn open_write(
        &self,
        path: &str,
        perms: u32,
        mtime: SystemTime,
        _log: &mut LogEntry,
    ) -> Result<Box<dyn DeviceWriter>> {
        self.device.check_connected()?;
        self.device
            .counters
            .open_writes
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeWriter {
            device: Arc::clone(&self.device),
            path: path.to_string(),
            perms,
            mtime,
            buf: Vec::new(),
        }))
    }

    fn stat(&self, path: &str, _log: &mut LogEntry) -> Result<DirEntry> {
        self.device.check_connected()?;
        self.device.counters.stats.fetch_add(1, Ordering::SeqCst);
        let files = self.device.files.lock().unwrap();
        match files.get(path) {
            Some(file) => Ok(self.device.entry_for(path, file)),
            None => Err(FsError::NoEntry {
                path: path.to_string(),
            }),
        }
    }

    fn list_dir_entries(&self, path: &str, _log: &mut LogEntry) -> Result<Vec<DirEntry>> {
        self.device.check_connected()?;
        self.device.counters.lists.fetch_add(1, Ordering::SeqCst);
        let files = self.device.files.lock().unwrap();
        if !files.contains_key(path) {
            return Err(FsError::NoEntry {
                path: path.to_string(),
            });
        }
        Ok(files
            .iter()
            .filter(|(child, _)| child.as_str() != "/" && parent_dir(child) == path)
            .map(|(child, file)| self.device.entry_for(child, file))
            .collect())
    }

    fn run_command(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.device.check_connected()?;
        let mut line = String::from(cmd);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.device.commands.lock().unwrap().push(line.clone());
        Ok(self
            .device
            .shell_outputs
            .lock()
            .unwrap()
            .get(&line)
            .cloned()
            .unwrap_or_default())
    }
}

struct FakeWriter {
    device: Arc<FakeDevice>,
    path: String,
    perms: u32,
    mtime: SystemTime,
    buf: Vec<u8>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl DeviceWriter for FakeWriter {
    fn close(self: Box<Self>) -> Result<()> {
        self.device.check_connected()?;
        let mut files = self.device.files.lock().unwrap();
        files.insert(
            self.path.clone(),
            FakeFile {
                mode: libc::S_IFREG as u32 | (self.perms & 0o777),
                mtime: self.mtime,
                contents: self.buf.clone(),
            },
        );
        self.device
            .writebacks
            .lock()
            .unwrap()
            .push((self.path.clone(), self.buf));
        Ok(())
    }
}
