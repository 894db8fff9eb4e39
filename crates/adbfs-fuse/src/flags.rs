//! Open-flag helpers around the bits passed to `open(2)`.

use std::fmt;
use std::ops::BitOr;

/// The subset of `open(2)` flags the filesystem cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY as u32);
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY as u32);
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR as u32);
    pub const CREATE: OpenFlags = OpenFlags(libc::O_CREAT as u32);
    pub const EXCL: OpenFlags = OpenFlags(libc::O_EXCL as u32);
    pub const TRUNC: OpenFlags = OpenFlags(libc::O_TRUNC as u32);
    pub const APPEND: OpenFlags = OpenFlags(libc::O_APPEND as u32);
    pub const SYNC: OpenFlags = OpenFlags(libc::O_SYNC as u32);

    pub fn from_raw(raw: u32) -> Self {
        OpenFlags(raw)
    }

    /// True if any of the bits in `bits` are set.
    pub fn contains(self, bits: OpenFlags) -> bool {
        self.0 & bits.0 != 0
    }

    /// O_RDONLY is zero, so readability is the absence of O_WRONLY.
    pub fn can_read(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    pub fn can_write(self) -> bool {
        self.contains(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (OpenFlags::WRONLY, "WRONLY"),
            (OpenFlags::RDWR, "RDWR"),
            (OpenFlags::CREATE, "CREATE"),
            (OpenFlags::EXCL, "EXCL"),
            (OpenFlags::TRUNC, "TRUNC"),
            (OpenFlags::APPEND, "APPEND"),
            (OpenFlags::SYNC, "SYNC"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("RDONLY")?;
        }
        Ok(())
    }
}
