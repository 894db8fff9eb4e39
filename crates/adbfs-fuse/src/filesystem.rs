//! The operation dispatcher: every kernel-facing operation, expressed
//! against device paths and translated into device calls.
//!
//! Short-lived calls (stat, listings, shell commands) borrow a client from
//! a bounded pool; open files bypass the pool and own a dedicated client
//! each, so a long transfer cannot starve a directory listing. Mutations go
//! through the device's shell (`mkdir`, `mv`, `rmdir`, `rm`) because the
//! sync protocol cannot express them; empty stdout means success and any
//! output is the device's error report.

use std::sync::Arc;
use std::time::Duration;

use adbfs_adb::DirEntry;
use tracing::info;

use crate::adb_file::AdbFile;
use crate::attr::FileAttributes;
use crate::device_client::{DeviceClient, DeviceClientFactory};
use crate::dir_cache::DirEntryCache;
use crate::error::{FsError, Result};
use crate::file_buffer::{DEFAULT_DIRTY_TIMEOUT, DONT_SET_PERMS};
use crate::flags::OpenFlags;
use crate::log_entry::LogEntry;
use crate::open_files::{OpenFiles, OpenFilesOptions};
use crate::paths::{join_device_path, parent_dir};
use crate::pool::{ClientPool, DEFAULT_POOL_SIZE};
use crate::statfs::{parse_statfs, StatfsInfo};

/// 64 symlink hops ought to be deep enough for anybody.
pub const MAX_LINK_RESOLVE_DEPTH: usize = 64;

/// Error strings printed by the readlink command on Android devices.
const READLINK_INVALID_ARGUMENT: &str = "readlink: Invalid argument";
const READLINK_PERMISSION_DENIED: &str = "readlink: Permission denied";

#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    /// Serial of the device this instance is bound to.
    pub device_serial: String,
    /// Absolute host path of the mountpoint; used to rewrite absolute
    /// symlink targets so they stay inside the mount.
    pub mountpoint: String,
    /// Device-side directory presented as the root of the mount.
    pub device_root: String,
    /// Capacity of the short-lived connection pool (minimum 1).
    pub pool_size: usize,
    /// Fail every mutating operation without contacting the device.
    pub read_only: bool,
    /// Maximum time a buffer may stay dirty before a write forces a flush.
    pub dirty_timeout: Duration,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            device_serial: String::new(),
            mountpoint: String::new(),
            device_root: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            read_only: false,
            dirty_timeout: DEFAULT_DIRTY_TIMEOUT,
        }
    }
}

pub struct AdbFilesystem {
    config: FilesystemConfig,
    pool: ClientPool,
    open_files: Arc<OpenFiles>,
    cache: Arc<DirEntryCache>,
}

impl AdbFilesystem {
    /// Builds the dispatcher and eagerly resolves a symlinked device root,
    /// so every later path translation is a plain join.
    pub fn new(
        mut config: FilesystemConfig,
        client_factory: DeviceClientFactory,
        cache: Arc<DirEntryCache>,
    ) -> Result<Self> {
        let pool = ClientPool::new(config.pool_size, &client_factory);
        info!(pool_size = config.pool_size.max(1), "connection pool ready");

        config.device_root = config.device_root.trim_end_matches('/').to_string();
        if !config.device_root.is_empty() {
            let mut log = LogEntry::start_operation("Initialize", &config.device_root);
            let client = pool.acquire();
            let (resolved, _) = resolve_symlinks(&**client, &config.device_root, &mut log)?;
            log.set_result(format!(
                "resolved device root {} -> {}",
                config.device_root, resolved
            ));
            log.record_status(0);
            config.device_root = resolved;
        }
        info!(device_root = %config.device_root, "device root set");

        let open_files = OpenFiles::new(OpenFilesOptions {
            client_factory,
            dirty_timeout: config.dirty_timeout,
        });

        Ok(Self {
            config,
            pool,
            open_files,
            cache,
        })
    }

    pub fn config(&self) -> &FilesystemConfig {
        &self.config
    }

    /// Translates a mount-relative name to an absolute device path.
    pub fn device_path(&self, name: &str) -> String {
        join_device_path(&self.config.device_root, name)
    }

    pub fn getattr(&self, name: &str) -> Result<FileAttributes> {
        let path = self.device_path(name);
        // Noisy under traversal; only errors get a record.
        let mut log = LogEntry::start_operation("GetAttr", &path).quiet();
        let result = (|| {
            let client = self.pool.acquire();
            let entry = client.stat(&path, &mut log)?;
            Ok(FileAttributes::from_entry(&entry))
        })();
        finish(log, result)
    }

    pub fn open_dir(&self, name: &str) -> Result<Vec<DirEntry>> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("OpenDir", &path);
        let result = (|| {
            let client = self.pool.acquire();
            let entries = client.list_dir_entries(&path, &mut log)?;
            log.set_result(format!("{} entries", entries.len()));
            Ok(entries)
        })();
        finish(log, result)
    }

    /// Reads a symlink target. Absolute targets are prefixed with the
    /// mountpoint so they appear confined to the mount; relative targets
    /// pass through untouched.
    pub fn readlink(&self, name: &str) -> Result<String> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("Readlink", &path);
        let result = (|| {
            let client = self.pool.acquire();
            let target = read_link(&**client, &path)?;
            let target = if target.starts_with('/') {
                format!(
                    "{}/{}",
                    self.config.mountpoint.trim_end_matches('/'),
                    target.trim_start_matches('/')
                )
            } else {
                target
            };
            log.set_result(target.clone());
            Ok(target)
        })();
        finish(log, result)
    }

    /// Existence-and-resolution check. Real permission bits are not
    /// consulted: any resolvable path is readable and executable, and on a
    /// writable mount also writable. Only a read-only mount rejects write
    /// access, as policy rather than permission.
    pub fn access(&self, name: &str, mask: u32) -> Result<()> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("Access", &path).quiet();
        let result = (|| {
            if mask & libc::W_OK as u32 != 0 && self.config.read_only {
                return Err(FsError::NotPermitted {
                    reason: "write access on a read-only mount".to_string(),
                });
            }
            let client = self.pool.acquire();
            resolve_symlinks(&**client, &path, &mut log)?;
            Ok(())
        })();
        finish(log, result)
    }

    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<AdbFile> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("Open", &path);
        let result = (|| {
            self.check_writable_open(flags)?;
            let buffer = self
                .open_files
                .get_or_load(&path, flags, DONT_SET_PERMS, &mut log)?;
            log.set_result(format!("flags={flags} size={}", buffer.size()));
            Ok(AdbFile::new(buffer, flags))
        })();
        finish(log, result)
    }

    /// Creates (or truncates) `name` and returns an open handle on it.
    pub fn create(&self, name: &str, flags: OpenFlags, perms: u32) -> Result<AdbFile> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("Create", &path);
        let result = (|| {
            let mut flags = flags | OpenFlags::CREATE | OpenFlags::TRUNC;
            if !flags.can_write() {
                flags = flags | OpenFlags::RDWR;
            }
            self.check_writable_open(flags)?;
            let buffer =
                self.open_files
                    .get_or_load(&path, flags, perms & 0o777, &mut log)?;
            log.set_result(format!("flags={flags}"));
            Ok(AdbFile::new(buffer, flags))
        })();
        finish(log, result)
    }

    pub fn mkdir(&self, name: &str) -> Result<()> {
        let path = self.device_path(name);
        let log = LogEntry::start_operation("Mkdir", &path);
        let result = self.shell_mutation("mkdir", &[&path], libc::EACCES, &path);
        finish(log, result)
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_path = self.device_path(old_name);
        let new_path = self.device_path(new_name);
        let log = LogEntry::start_operation("Rename", format!("{old_path} -> {new_path}"));
        let result = (|| {
            self.shell_mutation("mv", &[&old_path, &new_path], libc::EACCES, &old_path)?;
            // The destination directory changed too.
            self.cache.invalidate(parent_dir(&new_path));
            Ok(())
        })();
        finish(log, result)
    }

    pub fn rmdir(&self, name: &str) -> Result<()> {
        let path = self.device_path(name);
        let log = LogEntry::start_operation("Rmdir", &path);
        let result = self.shell_mutation("rmdir", &[&path], libc::EINVAL, &path);
        finish(log, result)
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        let path = self.device_path(name);
        let log = LogEntry::start_operation("Unlink", &path);
        let result = self.shell_mutation("rm", &[&path], libc::EACCES, &path);
        finish(log, result)
    }

    pub fn statfs(&self, name: &str) -> Result<StatfsInfo> {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation("StatFs", &path);
        let result = (|| {
            let client = self.pool.acquire();
            let (resolved, _) = resolve_symlinks(&**client, &path, &mut log)?;
            let output = client.run_command("stat", &["-f", &resolved])?;
            let info = parse_statfs(&output)?;
            log.set_result(format!("{info:?}"));
            Ok(info)
        })();
        finish(log, result)
    }

    /// Logs and returns the error for an operation this filesystem
    /// deliberately does not support.
    pub fn unsupported(&self, op: &'static str, name: &str) -> FsError {
        let path = self.device_path(name);
        let mut log = LogEntry::start_operation(op, &path);
        let err = FsError::NotImplemented { op };
        log.fail(&err);
        err
    }

    /// Open flags that would mutate the device are rejected up front on a
    /// read-only mount.
    fn check_writable_open(&self, flags: OpenFlags) -> Result<()> {
        if self.config.read_only
            && (flags.can_write()
                || flags.contains(OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::APPEND))
        {
            return Err(FsError::NotPermitted {
                reason: "write open on a read-only mount".to_string(),
            });
        }
        Ok(())
    }

    /// Runs a mutating shell command. Empty stdout is success; any output
    /// is an error report, classified by call site (`rmdir` prints usage
    /// errors, everything else is treated as a permission problem). On
    /// success the parent directory's cached listing is dropped so the next
    /// stat or listing sees the mutation.
    fn shell_mutation(&self, cmd: &str, args: &[&str], errno: i32, path: &str) -> Result<()> {
        if self.config.read_only {
            return Err(FsError::NotPermitted {
                reason: "mutation on a read-only mount".to_string(),
            });
        }

        let output = {
            let client = self.pool.acquire();
            client.run_command(cmd, args)?
        };

        if !output.is_empty() {
            let output = output.strip_suffix("\r\n").unwrap_or(&output).to_string();
            return Err(FsError::CommandFailed {
                command: cmd.to_string(),
                output,
                errno,
            });
        }

        self.cache.invalidate(parent_dir(path));
        Ok(())
    }
}

fn finish<T>(mut log: LogEntry, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => {
            log.record_status(0);
        }
        Err(err) => {
            log.fail(err);
        }
    }
    log.finish();
    result
}

/// Reads a symlink target with the device's readlink command. The sync
/// protocol has no readlink, and `readlink -f` is missing on some Android
/// versions, so one hop at a time is all that is portable.
fn read_link(client: &dyn DeviceClient, path: &str) -> Result<String> {
    let output = client.run_command("readlink", &[path])?;
    let target = output.strip_suffix("\r\n").unwrap_or(&output);

    match target {
        READLINK_INVALID_ARGUMENT => Err(FsError::NotALink {
            path: path.to_string(),
        }),
        READLINK_PERMISSION_DENIED => Err(FsError::NoPermission {
            path: path.to_string(),
        }),
        _ => Ok(target.to_string()),
    }
}

/// Follows symlinks until a non-link entry is reached, bounded at
/// [`MAX_LINK_RESOLVE_DEPTH`] hops.
pub(crate) fn resolve_symlinks(
    client: &dyn DeviceClient,
    path: &str,
    log: &mut LogEntry,
) -> Result<(String, DirEntry)> {
    let mut path = path.to_string();
    let mut entry = client.stat(&path, log)?;
    let mut depth = 0;

    while entry.is_symlink() {
        if depth >= MAX_LINK_RESOLVE_DEPTH {
            return Err(FsError::LinkTooDeep { path });
        }
        depth += 1;
        path = read_link(client, &path)?;
        entry = client.stat(&path, log)?;
    }

    Ok((path, entry))
}
