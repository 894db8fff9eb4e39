//! The bridge between the kernel's inode-addressed FUSE callbacks and the
//! path-based dispatcher.
//!
//! Every callback resolves the inode to a mount-relative path through the
//! inode table, calls the dispatcher, and maps failures to errnos in the
//! reply. Open handles hold [`AdbFile`]s; the handle table is shared and
//! handles are cloned out of it so slow buffer I/O never blocks unrelated
//! callbacks.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::debug;

use crate::adb_file::AdbFile;
use crate::attr::{kind_from_mode, FileAttributes};
use crate::filesystem::AdbFilesystem;
use crate::flags::OpenFlags;
use crate::inode::InodeTable;

const ATTR_TTL: Duration = Duration::from_secs(1);

struct HandleTable {
    next_fh: u64,
    open: HashMap<u64, Arc<AdbFile>>,
}

pub struct AdbFuse {
    fs: AdbFilesystem,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HandleTable>,
}

impl AdbFuse {
    pub fn new(fs: AdbFilesystem) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HandleTable {
                next_fh: 1,
                open: HashMap::new(),
            }),
        }
    }

    pub fn filesystem(&self) -> &AdbFilesystem {
        &self.fs
    }

    fn path_for(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_string_lossy();
        self.inodes
            .lock()
            .unwrap()
            .child_path(parent, &name)
            .ok_or(libc::ENOENT)
    }

    fn store_handle(&self, file: AdbFile) -> u64 {
        let mut handles = self.handles.lock().unwrap();
        let fh = handles.next_fh;
        handles.next_fh += 1;
        handles.open.insert(fh, Arc::new(file));
        fh
    }

    fn handle(&self, fh: u64) -> Result<Arc<AdbFile>, c_int> {
        self.handles
            .lock()
            .unwrap()
            .open
            .get(&fh)
            .cloned()
            .ok_or(libc::EBADF)
    }

    fn fuser_attr(&self, ino: u64, attr: &FileAttributes) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: attr.kind(),
            perm: attr.perm(),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Attributes for a handle that may not be statable yet (a created file
    /// is only materialized on first flush).
    fn attr_from_handle(&self, ino: u64, file: &AdbFile) -> fuser::FileAttr {
        let buffer = file.buffer();
        let attr = FileAttributes {
            mode: libc::S_IFREG as u32 | buffer.perms(),
            size: buffer.size(),
            mtime: SystemTime::now(),
        };
        self.fuser_attr(ino, &attr)
    }
}

impl Filesystem for AdbFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!(mountpoint = %self.fs.config().mountpoint, "filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.lock().unwrap().intern(&path);
                reply.entry(&ATTR_TTL, &self.fuser_attr(ino, &attr), 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.lock().unwrap().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.fuser_attr(ino, &attr)),
            // A freshly created file exists only in its buffer until the
            // first flush; answer from the handle if we have one.
            Err(err) => match fh.and_then(|fh| self.handle(fh).ok()) {
                Some(file) => reply.attr(&ATTR_TTL, &self.attr_from_handle(ino, &file)),
                None => reply.error(err.to_errno()),
            },
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        // Size on an open handle is the one supported mutation; everything
        // else (chmod, chown, utimens, truncate-by-path) is unsupported.
        if let Some(size) = size {
            let file = match fh.map(|fh| self.handle(fh)) {
                Some(Ok(file)) => file,
                Some(Err(errno)) => return reply.error(errno),
                None => return reply.error(self.fs.unsupported("Truncate", &path).to_errno()),
            };
            return match file.truncate(size) {
                Ok(()) => reply.attr(&ATTR_TTL, &self.attr_from_handle(ino, &file)),
                Err(err) => reply.error(err.to_errno()),
            };
        }

        let op = if mode.is_some() {
            "Chmod"
        } else if uid.is_some() || gid.is_some() {
            "Chown"
        } else {
            "Utimens"
        };
        reply.error(self.fs.unsupported(op, &path).to_errno());
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        reply.error(self.fs.unsupported("Mknod", &name).to_errno());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        if let Err(err) = self.fs.mkdir(&path) {
            return reply.error(err.to_errno());
        }
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.lock().unwrap().intern(&path);
                reply.entry(&ATTR_TTL, &self.fuser_attr(ino, &attr), 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.lock().unwrap().remove_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.lock().unwrap().remove_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name = link_name.to_string_lossy().into_owned();
        reply.error(self.fs.unsupported("Symlink", &name).to_errno());
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let old_path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let new_path = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.rename(&old_path, &new_path) {
            Ok(()) => {
                self.inodes.lock().unwrap().rename(&old_path, &new_path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let name = newname.to_string_lossy().into_owned();
        reply.error(self.fs.unsupported("Link", &name).to_errno());
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.open(&path, OpenFlags::from_raw(flags as u32)) {
            Ok(file) => {
                let fh = self.store_handle(file);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file = match self.handle(fh) {
            Ok(file) => file,
            Err(errno) => return reply.error(errno),
        };
        let mut buf = vec![0u8; size as usize];
        match file.read(&mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = match self.handle(fh) {
            Ok(file) => file,
            Err(errno) => return reply.error(errno),
        };
        match file.write(data, offset.max(0) as u64) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let file = match self.handle(fh) {
            Ok(file) => file,
            Err(errno) => return reply.error(errno),
        };
        match file.flush() {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let removed = self.handles.lock().unwrap().open.remove(&fh);
        if let Some(file) = removed {
            file.release();
        }
        // Release never fails.
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let file = match self.handle(fh) {
            Ok(file) => file,
            Err(errno) => return reply.error(errno),
        };
        match file.fsync() {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.getattr(&path) {
            Ok(attr) if attr.kind() == fuser::FileType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let entries = match self.fs.open_dir(&path) {
            Ok(entries) => entries,
            Err(err) => return reply.error(err.to_errno()),
        };

        let mut inodes = self.inodes.lock().unwrap();
        let mut next = offset + 1;

        if offset < 1 {
            if reply.add(ino, next, fuser::FileType::Directory, ".") {
                return reply.ok();
            }
            next += 1;
        }
        if offset < 2 {
            if reply.add(ino, next, fuser::FileType::Directory, "..") {
                return reply.ok();
            }
            next += 1;
        }

        for entry in entries.iter().skip((offset - 2).max(0) as usize) {
            let child = if path.is_empty() {
                entry.name.clone()
            } else {
                format!("{path}/{}", entry.name)
            };
            let child_ino = inodes.assign(&child);
            if reply.add(child_ino, next, kind_from_mode(entry.mode), &entry.name) {
                break;
            }
            next += 1;
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.statfs(&path) {
            Ok(info) => reply.statfs(
                info.blocks,
                info.bfree,
                info.bavail,
                info.files,
                info.ffree,
                info.bsize,
                info.namelen,
                info.bsize,
            ),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = self.path_for(ino).unwrap_or_default();
        reply.error(self.fs.unsupported("SetXAttr", &path).to_errno());
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        let path = self.path_for(ino).unwrap_or_default();
        reply.error(self.fs.unsupported("GetXAttr", &path).to_errno());
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, _size: u32, reply: ReplyXattr) {
        let path = self.path_for(ino).unwrap_or_default();
        reply.error(self.fs.unsupported("ListXAttr", &path).to_errno());
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        let path = self.path_for(ino).unwrap_or_default();
        reply.error(self.fs.unsupported("RemoveXAttr", &path).to_errno());
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_for(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.access(&path, mask as u32) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let perms = mode & !umask;
        match self
            .fs
            .create(&path, OpenFlags::from_raw(flags as u32), perms)
        {
            Ok(file) => {
                let ino = self.inodes.lock().unwrap().intern(&path);
                // The file exists only in the buffer until its first flush,
                // so attributes come from the handle rather than a stat.
                let attr = self.attr_from_handle(ino, &file);
                let fh = self.store_handle(file);
                reply.created(&ATTR_TTL, &attr, 0, fh, 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }
}
