use std::cmp::{max, min};
use std::ffi::OsString;
use std::time::{Duration, SystemTime};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::ll::fuse_abi::consts::*;
use crate::ll::fuse_abi::{self as abi, fuse_init_out};
use crate::session::MAX_WRITE_SIZE;

/* ------ FUSE configuration ------ */

/// We generally support async reads
const INIT_FLAGS: u64 = FUSE_ASYNC_READ | FUSE_BIG_WRITES;

const fn default_init_flags(capabilities: u64) -> u64 {
    let mut flags = INIT_FLAGS;
    if capabilities & FUSE_MAX_PAGES != 0 {
        flags |= FUSE_MAX_PAGES;
    }
    flags
}

/// Configuration of the fuse kernel module connection
#[derive(Debug)]
pub struct KernelConfig {
    pub(crate) capabilities: u64,
    pub(crate) requested: u64,
    pub(crate) max_readahead: u32,
    pub(crate) max_max_readahead: u32,
    pub(crate) max_background: u16,
    pub(crate) congestion_threshold: Option<u16>,
    pub(crate) max_write: u32,
    pub(crate) time_gran: Duration,
}

impl KernelConfig {
    pub(crate) fn new(capabilities: u64, max_readahead: u32) -> Self {
        Self {
            capabilities,
            requested: default_init_flags(capabilities),
            max_readahead,
            max_max_readahead: max_readahead,
            max_background: 16,
            congestion_threshold: None,
            // use a max write size that fits into the session's buffer
            max_write: MAX_WRITE_SIZE as u32,
            // 1ns means nano-second granularity.
            time_gran: Duration::new(0, 1),
        }
    }

    /// Set the timestamp granularity
    ///
    /// Must be a power of 10 nanoseconds. i.e. 1s, 0.1s, 0.01s, 1ms, 0.1ms...etc
    ///
    /// On success returns the previous value. On error returns the nearest value which will succeed
    pub fn set_time_granularity(&mut self, value: Duration) -> Result<Duration, Duration> {
        if value.as_nanos() == 0 {
            return Err(Duration::new(0, 1));
        }
        if value.as_secs() > 1 || (value.as_secs() == 1 && value.subsec_nanos() > 0) {
            return Err(Duration::new(1, 0));
        }
        let mut power_of_10 = 1;
        while power_of_10 < value.as_nanos() {
            if value.as_nanos() < power_of_10 * 10 {
                // value must not be a power of ten, since power_of_10 < value < power_of_10 * 10
                return Err(Duration::new(0, power_of_10 as u32));
            }
            power_of_10 *= 10;
        }
        let previous = self.time_gran;
        self.time_gran = value;
        Ok(previous)
    }

    /// Set the maximum write size for a single request
    ///
    /// On success returns the previous value. On error returns the nearest value which will succeed
    pub fn set_max_write(&mut self, value: u32) -> Result<u32, u32> {
        if value == 0 {
            return Err(1);
        }
        if value > MAX_WRITE_SIZE as u32 {
            return Err(MAX_WRITE_SIZE as u32);
        }
        let previous = self.max_write;
        self.max_write = value;
        Ok(previous)
    }

    /// Set the maximum readahead size
    ///
    /// On success returns the previous value. On error returns the nearest value which will succeed
    pub fn set_max_readahead(&mut self, value: u32) -> Result<u32, u32> {
        if value == 0 {
            return Err(1);
        }
        if value > self.max_max_readahead {
            return Err(self.max_max_readahead);
        }
        let previous = self.max_readahead;
        self.max_readahead = value;
        Ok(previous)
    }

    /// Add a set of capabilities.
    ///
    /// On error returns the bits the kernel did not offer.
    pub fn add_capabilities(&mut self, capabilities_to_add: u64) -> Result<(), u64> {
        if capabilities_to_add & self.capabilities != capabilities_to_add {
            return Err(capabilities_to_add - (capabilities_to_add & self.capabilities));
        }
        self.requested |= capabilities_to_add;
        Ok(())
    }

    /// Set the maximum number of pending background requests. Such as readahead requests.
    ///
    /// On success returns the previous value. On error returns the nearest value which will succeed
    pub fn set_max_background(&mut self, value: u16) -> Result<u16, u16> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.max_background;
        self.max_background = value;
        Ok(previous)
    }

    /// Set the threshold of background requests at which the kernel will consider the filesystem
    /// request queue congested.
    ///
    /// On success returns the previous value. On error returns the nearest value which will succeed
    pub fn set_congestion_threshold(&mut self, value: u16) -> Result<u16, u16> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.congestion_threshold();
        self.congestion_threshold = Some(value);
        Ok(previous)
    }

    fn congestion_threshold(&self) -> u16 {
        match self.congestion_threshold {
            // Default to a threshold of 3/4 of the max background threads
            None => (self.max_background as u32 * 3 / 4) as u16,
            Some(value) => min(value, self.max_background),
        }
    }

    fn max_pages(&self) -> u16 {
        ((max(self.max_write, self.max_readahead).saturating_sub(1)) / page_size::get() as u32)
            as u16
            + 1
    }

    /// Capabilities this filesystem asks the kernel for
    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub(crate) fn into_fuse_init_out(self, flags: u64) -> fuse_init_out {
        fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: self.max_readahead,
            flags: flags as u32,
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold(),
            max_write: self.max_write,
            time_gran: self.time_gran.as_nanos() as u32,
            max_pages: self.max_pages(),
            map_alignment: 0,
            unused: [0; 8],
        }
    }
}

/* ------ Operation input/output types ------ */

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// Named pipe (S_IFIFO)
    NamedPipe,
    /// Character device (S_IFCHR)
    CharDevice,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Directory (S_IFDIR)
    Directory,
    /// Regular file (S_IFREG)
    RegularFile,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Unix domain socket (S_IFSOCK)
    Socket,
}

/// File attributes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileAttr {
    /// Inode number
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Size in blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Time of creation (macOS only)
    pub crtime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size
    pub blksize: u32,
    /// Flags (macOS only, see chflags(2))
    pub flags: u32,
}

/// Result of a successful `lookup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Describes a file
    pub attr: FileAttr,
    /// How long the kernel may cache both the name and the attributes
    pub ttl: Duration,
    /// Inode generation; (ino, generation) must be unique over the filesystem's lifetime
    pub generation: u64,
}

/// Result of a successful `getattr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    /// Describes a file
    pub attr: FileAttr,
    /// How long the kernel may cache the attributes
    pub ttl: Duration,
}

/// Result of a successful `open`/`opendir`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Open {
    /// File handle echoed back by the kernel on every later operation on this open file
    pub fh: u64,
    /// `FOPEN_*` flags
    pub flags: u32,
}

/// Filesystem statistics, as returned by `statfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statfs {
    /// Total data blocks, in `frsize` units
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Preferred I/O block size
    pub bsize: u32,
    /// Maximum name length
    pub namelen: u32,
    /// Fragment size
    pub frsize: u32,
}

impl Default for Statfs {
    fn default() -> Self {
        Statfs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 512,
            namelen: 255,
            frsize: 0,
        }
    }
}

/// One entry of a directory listing returned by `readdir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode the entry names
    pub ino: u64,
    /// Cursor the kernel passes back to resume the listing right after this entry
    pub offset: i64,
    /// File type, as in the inode's attributes
    pub kind: FileType,
    /// Entry name, without any path separator
    pub name: OsString,
}

/// A `forget` target: drop `nlookup` references to `ino`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forget {
    /// Inode to forget
    pub ino: u64,
    /// Number of lookups to drop
    pub nlookup: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_granularity() {
        let mut config = KernelConfig::new(0, 4096);
        assert_eq!(
            config.set_time_granularity(Duration::from_millis(1)),
            Ok(Duration::new(0, 1))
        );
        assert_eq!(
            config.set_time_granularity(Duration::from_nanos(150)),
            Err(Duration::from_nanos(100))
        );
        assert_eq!(
            config.set_time_granularity(Duration::from_secs(2)),
            Err(Duration::from_secs(1))
        );
        assert_eq!(
            config.set_time_granularity(Duration::ZERO),
            Err(Duration::new(0, 1))
        );
    }

    #[test]
    fn capabilities_must_be_offered() {
        let mut config = KernelConfig::new(FUSE_ASYNC_READ | FUSE_EXPORT_SUPPORT, 4096);
        assert_eq!(config.add_capabilities(FUSE_EXPORT_SUPPORT), Ok(()));
        assert_ne!(config.requested() & FUSE_EXPORT_SUPPORT, 0);
        assert_eq!(
            config.add_capabilities(FUSE_DO_READDIRPLUS),
            Err(FUSE_DO_READDIRPLUS)
        );
    }

    #[test]
    fn readahead_is_capped_by_kernel() {
        let mut config = KernelConfig::new(0, 4096);
        assert_eq!(config.set_max_readahead(8192), Err(4096));
        assert_eq!(config.set_max_readahead(1024), Ok(4096));
        assert_eq!(config.set_max_readahead(0), Err(1));
    }

    #[test]
    fn max_write_fits_session_buffer() {
        let mut config = KernelConfig::new(0, 4096);
        assert_eq!(config.set_max_write(0), Err(1));
        assert_eq!(
            config.set_max_write(MAX_WRITE_SIZE as u32 + 1),
            Err(MAX_WRITE_SIZE as u32)
        );
        assert_eq!(config.set_max_write(4096), Ok(MAX_WRITE_SIZE as u32));
        assert_eq!(config.set_max_write(8192), Ok(4096));
        let out = config.into_fuse_init_out(0);
        assert_eq!(out.max_write, 8192);
        assert_eq!(out.max_pages as usize, (8192 - 1) / page_size::get() + 1);
    }

    #[test]
    fn congestion_threshold_is_capped_by_max_background() {
        let mut config = KernelConfig::new(0, 4096);
        assert_eq!(config.set_congestion_threshold(0), Err(1));
        // 3/4 of the default max_background of 16
        assert_eq!(config.set_congestion_threshold(10), Ok(12));
        assert_eq!(config.set_congestion_threshold(40), Ok(10));
        assert_eq!(config.set_max_background(20), Ok(16));
        let out = config.into_fuse_init_out(0);
        assert_eq!(out.max_background, 20);
        assert_eq!(out.congestion_threshold, 20);
    }

    #[test]
    fn init_out_encoding() {
        let mut config = KernelConfig::new(FUSE_MAX_PAGES, 4096);
        config.set_max_background(8).unwrap();
        let out = config.into_fuse_init_out(FUSE_ASYNC_READ);
        assert_eq!(out.major, 7);
        assert_eq!(out.minor, 31);
        assert_eq!(out.flags as u64, FUSE_ASYNC_READ);
        assert_eq!(out.max_background, 8);
        assert_eq!(out.congestion_threshold, 6);
        assert_eq!(out.max_write, MAX_WRITE_SIZE as u32);
        assert!(out.max_pages >= 1);
    }

    #[test]
    fn statfs_defaults() {
        let st = Statfs::default();
        assert_eq!((st.blocks, st.files), (0, 0));
        assert_eq!((st.bsize, st.namelen), (512, 255));
    }
}
