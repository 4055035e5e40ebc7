//! Low-level kernel communication.

pub(crate) mod argument;
pub mod fuse_abi;
pub(crate) mod reply;
pub(crate) mod request;

use std::{convert::TryInto, fmt::Display, num::NonZeroI32, time::SystemTime};

pub use reply::Response;
pub use request::{AnyRequest, Operation};
pub(crate) use reply::{DirEntList, DirEntOffset, DirEntry};

/// Unique identifier of a request, echoed back in its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);
impl From<RequestId> for u64 {
    fn from(fh: RequestId) -> Self {
        fh.0
    }
}

/// Inode number as it travels on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INodeNo(pub u64);
impl From<INodeNo> for u64 {
    fn from(fh: INodeNo) -> Self {
        fh.0
    }
}

/// File handle chosen by the filesystem in `open`/`opendir`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);
impl From<FileHandle> for u64 {
    fn from(fh: FileHandle) -> Self {
        fh.0
    }
}

/// Identifies the owner of POSIX locks on a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);
impl From<LockOwner> for u64 {
    fn from(fh: LockOwner) -> Self {
        fh.0
    }
}

/// Inode generation; together with the inode number it must be unique over the lifetime of
/// the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);
impl From<Generation> for u64 {
    fn from(fh: Generation) -> Self {
        fh.0
    }
}

/// FUSE protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);
impl Version {
    /// Major number
    pub fn major(&self) -> u32 {
        self.0
    }
    /// Minor number
    pub fn minor(&self) -> u32 {
        self.1
    }
}
impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Error code sent back to the kernel in place of a reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno {
    ($x:expr) => {
        Errno(match NonZeroI32::new($x) {
            Some(x) => x,
            None => panic!("errno must be non-zero"),
        })
    };
}

impl Errno {
    /// Operation not permitted
    pub const EPERM: Errno = errno!(libc::EPERM);
    /// No such file or directory
    pub const ENOENT: Errno = errno!(libc::ENOENT);
    /// Interrupted system call
    pub const EINTR: Errno = errno!(libc::EINTR);
    /// Input/output error
    pub const EIO: Errno = errno!(libc::EIO);
    /// File exists
    pub const EEXIST: Errno = errno!(libc::EEXIST);
    /// Bad file descriptor
    pub const EBADF: Errno = errno!(libc::EBADF);
    /// Permission denied
    pub const EACCES: Errno = errno!(libc::EACCES);
    /// Not a directory
    pub const ENOTDIR: Errno = errno!(libc::ENOTDIR);
    /// Is a directory
    pub const EISDIR: Errno = errno!(libc::EISDIR);
    /// Invalid argument
    pub const EINVAL: Errno = errno!(libc::EINVAL);
    /// Read-only file system
    pub const EROFS: Errno = errno!(libc::EROFS);
    /// Function not implemented
    pub const ENOSYS: Errno = errno!(libc::ENOSYS);
    /// Protocol error
    pub const EPROTO: Errno = errno!(libc::EPROTO);

    /// Build an error from a raw errno value. Zero is not an error and maps to `EIO`.
    pub fn from_i32(err: i32) -> Errno {
        err.try_into().ok().map_or(Errno::EIO, Errno)
    }

    /// The raw errno value
    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl From<std::io::Error> for Errno {
    fn from(x: std::io::Error) -> Self {
        x.raw_os_error().map_or(Errno::EIO, Errno::from_i32)
    }
}

impl From<Errno> for i32 {
    fn from(x: Errno) -> Self {
        x.code()
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.code())
    }
}

/// Seconds and nanoseconds relative to the epoch, as `fuse_attr` carries them
pub(crate) fn time_from_system_time(system_time: &SystemTime) -> (i64, u32) {
    // Convert to signed 64-bit time with epoch at 0
    match system_time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => (duration.as_secs() as i64, duration.subsec_nanos()),
        Err(before_epoch_error) => (
            -(before_epoch_error.duration().as_secs() as i64),
            before_epoch_error.duration().subsec_nanos(),
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn errno_from_raw() {
        assert_eq!(Errno::from_i32(libc::ENOENT), Errno::ENOENT);
        assert_eq!(Errno::from_i32(0), Errno::EIO);
        assert_eq!(i32::from(Errno::ENOSYS), libc::ENOSYS);
    }

    #[test]
    fn errno_from_io_error() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Errno::from(err), Errno::EACCES);
        let err = std::io::Error::other("no os error");
        assert_eq!(Errno::from(err), Errno::EIO);
    }

    #[test]
    fn version_ordering() {
        assert!(Version(7, 5) < Version(7, 6));
        assert!(Version(8, 0) > Version(7, 31));
        assert_eq!(Version(7, 31).to_string(), "7.31");
    }

    #[test]
    fn system_time_conversion() {
        let t = SystemTime::UNIX_EPOCH + Duration::new(0x1234, 0x5678);
        assert_eq!(time_from_system_time(&t), (0x1234, 0x5678));
        assert_eq!(time_from_system_time(&SystemTime::UNIX_EPOCH), (0, 0));
    }
}
