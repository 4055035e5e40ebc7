//! Reply encoding.
//!
//! A `Response` is one complete reply to the kernel: an out header followed by an optional
//! payload. Directory listings are built with `DirEntList`, a bounded writer that refuses
//! any record which would push the payload past the size the kernel asked for.

use std::{
    convert::TryInto,
    io::IoSlice,
    mem::size_of,
    os::unix::ffi::OsStrExt,
    path::Path,
    time::Duration,
};

use smallvec::{smallvec, SmallVec};
use zerocopy::{Immutable, IntoBytes};

use super::{fuse_abi as abi, time_from_system_time, Errno, FileHandle, Generation, INodeNo};
use crate::data::{FileAttr, FileType};

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// One reply to the kernel
#[derive(Debug)]
pub enum Response<'a> {
    /// Negative errno, or zero for an empty success
    Error(i32),
    /// Owned payload
    Data(ResponseBuf),
    /// Borrowed payload, sent without copying
    Slice(&'a [u8]),
}

impl<'a> Response<'a> {
    /// Total length of the reply on the wire, header included
    pub(crate) fn len(&self) -> usize {
        size_of::<abi::fuse_out_header>()
            + match self {
                Response::Error(_) => 0,
                Response::Data(v) => v.len(),
                Response::Slice(d) => d.len(),
            }
    }

    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        unique: super::RequestId,
        f: F,
    ) -> T {
        let header = abi::fuse_out_header {
            unique: unique.0,
            error: if let Response::Error(errno) = self {
                -errno
            } else {
                0
            },
            len: self
                .len()
                .try_into()
                .expect("Too much data for a FUSE reply"),
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(header.as_bytes())];
        match &self {
            Response::Error(_) => {}
            Response::Data(d) => v.push(IoSlice::new(d)),
            Response::Slice(d) => v.push(IoSlice::new(d)),
        }
        f(&v)
    }

    // Constructors
    pub(crate) fn new_empty() -> Self {
        Self::Error(0)
    }

    pub(crate) fn new_error(error: Errno) -> Self {
        Self::Error(error.code())
    }

    pub(crate) fn new_entry(
        ino: INodeNo,
        generation: Generation,
        attr: &Attr,
        attr_ttl: Duration,
        entry_ttl: Duration,
    ) -> Self {
        let d = abi::fuse_entry_out {
            nodeid: ino.into(),
            generation: generation.into(),
            entry_valid: entry_ttl.as_secs(),
            attr_valid: attr_ttl.as_secs(),
            entry_valid_nsec: entry_ttl.subsec_nanos(),
            attr_valid_nsec: attr_ttl.subsec_nanos(),
            attr: attr.attr,
        };
        Self::from_struct(&d)
    }

    pub(crate) fn new_attr(ttl: &Duration, attr: &Attr) -> Self {
        let r = abi::fuse_attr_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            dummy: 0,
            attr: attr.attr,
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_open(fh: FileHandle, flags: u32) -> Self {
        let r = abi::fuse_open_out {
            fh: fh.into(),
            open_flags: flags,
            padding: 0,
        };
        Self::from_struct(&r)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_statfs(
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) -> Self {
        let r = abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks,
                bfree,
                bavail,
                files,
                ffree,
                bsize,
                namelen,
                frsize,
                padding: 0,
                spare: [0; 6],
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_init(out: &abi::fuse_init_out) -> Self {
        Self::from_struct(out)
    }

    pub(crate) fn new_slice(data: &'a [u8]) -> Self {
        Self::Slice(data)
    }

    pub(crate) fn new_directory(list: DirEntList) -> Self {
        assert!(list.buf.len() <= list.max_size);
        Self::Data(list.buf)
    }

    fn from_struct<T: IntoBytes + Immutable + ?Sized>(data: &T) -> Self {
        Self::Data(SmallVec::from_slice(data.as_bytes()))
    }
}

/// Attributes in the form the kernel expects them
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attr {
    pub(crate) attr: abi::fuse_attr,
}

impl From<&FileAttr> for Attr {
    fn from(attr: &FileAttr) -> Self {
        let (atime_secs, atime_nanos) = time_from_system_time(&attr.atime);
        let (mtime_secs, mtime_nanos) = time_from_system_time(&attr.mtime);
        let (ctime_secs, ctime_nanos) = time_from_system_time(&attr.ctime);
        Self {
            attr: abi::fuse_attr {
                ino: attr.ino,
                size: attr.size,
                blocks: attr.blocks,
                atime: atime_secs,
                mtime: mtime_secs,
                ctime: ctime_secs,
                atimensec: atime_nanos,
                mtimensec: mtime_nanos,
                ctimensec: ctime_nanos,
                mode: mode_from_kind_and_perm(attr.kind, attr.perm),
                nlink: attr.nlink,
                uid: attr.uid,
                gid: attr.gid,
                rdev: attr.rdev,
                blksize: attr.blksize,
                padding: 0,
            },
        }
    }
}

impl From<FileAttr> for Attr {
    fn from(attr: FileAttr) -> Self {
        Self::from(&attr)
    }
}

/// Resume cursor of a directory entry: the offset the kernel passes back to continue the
/// listing right after this entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntOffset(pub i64);
impl From<DirEntOffset> for i64 {
    fn from(x: DirEntOffset) -> Self {
        x.0
    }
}

/// One record of a directory listing
#[derive(Debug)]
pub struct DirEntry<T: AsRef<Path>> {
    ino: INodeNo,
    offset: DirEntOffset,
    kind: FileType,
    name: T,
}

impl<T: AsRef<Path>> DirEntry<T> {
    pub fn new(ino: INodeNo, offset: DirEntOffset, kind: FileType, name: T) -> DirEntry<T> {
        DirEntry::<T> {
            ino,
            offset,
            kind,
            name,
        }
    }
}

/// Data buffer used to pack directory entries into a reply.
///
/// The buffer never grows past `max_size` bytes; `push` reports whether it refused a record.
#[derive(Debug)]
pub struct DirEntList {
    max_size: usize,
    buf: ResponseBuf,
}

impl From<DirEntList> for Response<'_> {
    fn from(l: DirEntList) -> Self {
        Response::new_directory(l)
    }
}

impl DirEntList {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buf: ResponseBuf::new(),
        }
    }

    /// Bytes packed so far
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Add an entry to the directory reply buffer. Returns true if the buffer is full and
    /// the entry was not added. A transparent offset value is stored with each entry; the
    /// kernel uses it to request the next entries in further readdir calls.
    #[must_use]
    pub fn push<T: AsRef<Path>>(&mut self, ent: &DirEntry<T>) -> bool {
        let name = ent.name.as_ref().as_os_str().as_bytes();
        let header = abi::fuse_dirent {
            ino: ent.ino.into(),
            off: ent.offset.0,
            namelen: name.len().try_into().expect("Name too long"),
            typ: mode_from_kind_and_perm(ent.kind, 0) >> 12,
        };
        let entlen = size_of::<abi::fuse_dirent>() + name.len();
        let entsize = entlen.next_multiple_of(size_of::<u64>()); // 64bit align
        let padlen = entsize - entlen;
        if self.buf.len() + entsize > self.max_size {
            return true;
        }
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + padlen, 0);
        false
    }
}

/// Returns the mode for a given file kind and permission
pub(crate) fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) as u32
        | perm as u32
}
