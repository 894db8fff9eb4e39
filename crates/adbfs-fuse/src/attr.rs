//! Conversion from device directory entries to kernel-facing attributes.

use std::time::SystemTime;

use adbfs_adb::DirEntry;
use fuser::FileType;

/// The attribute view the kernel sees: the file-type bit (regular,
/// directory, symlink, fifo), the 9 permission bits, size, and mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    pub mode: u32,
    pub size: u64,
    pub mtime: SystemTime,
}

impl FileAttributes {
    pub fn from_entry(entry: &DirEntry) -> Self {
        Self {
            mode: file_mode_bits(entry),
            size: entry.size,
            mtime: entry.modified_at,
        }
    }

    pub fn kind(&self) -> FileType {
        kind_from_mode(self.mode)
    }

    pub fn perm(&self) -> u16 {
        (self.mode & 0o777) as u16
    }
}

/// Only the four file types the device filesystem surfaces are converted;
/// anything else is presented as a regular file.
fn file_mode_bits(entry: &DirEntry) -> u32 {
    let type_bits = if entry.is_dir() {
        libc::S_IFDIR as u32
    } else if entry.is_symlink() {
        libc::S_IFLNK as u32
    } else if entry.is_fifo() {
        libc::S_IFIFO as u32
    } else {
        libc::S_IFREG as u32
    };
    type_bits | entry.permissions()
}

pub fn kind_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        _ => FileType::RegularFile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn entry(mode: u32, size: u64) -> DirEntry {
        DirEntry {
            name: "x".to_string(),
            mode,
            size,
            modified_at: UNIX_EPOCH,
        }
    }

    #[test]
    fn regular_file_attributes() {
        let attr = FileAttributes::from_entry(&entry(0o100644, 11));
        assert_eq!(attr.kind(), FileType::RegularFile);
        assert_eq!(attr.perm(), 0o644);
        assert_eq!(attr.size, 11);
    }

    #[test]
    fn directory_attributes() {
        let attr = FileAttributes::from_entry(&entry(0o040755, 4096));
        assert_eq!(attr.kind(), FileType::Directory);
        assert_eq!(attr.perm(), 0o755);
    }

    #[test]
    fn symlink_attributes() {
        let attr = FileAttributes::from_entry(&entry(0o120777, 7));
        assert_eq!(attr.kind(), FileType::Symlink);
    }

    #[test]
    fn fifo_attributes() {
        let attr = FileAttributes::from_entry(&entry(0o010600, 0));
        assert_eq!(attr.kind(), FileType::NamedPipe);
        assert_eq!(attr.perm(), 0o600);
    }

    #[test]
    fn unknown_type_presents_as_regular() {
        // Character device on the device side.
        let attr = FileAttributes::from_entry(&entry(0o020644, 0));
        assert_eq!(attr.kind(), FileType::RegularFile);
    }

    #[test]
    fn setuid_bits_are_dropped() {
        let attr = FileAttributes::from_entry(&entry(0o104755, 0));
        assert_eq!(attr.perm(), 0o755);
        assert_eq!(attr.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
    }
}
