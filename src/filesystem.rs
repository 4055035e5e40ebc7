//! The `Filesystem` trait.
//!
//! One method per kernel operation. Each method returns its reply payload or an `Errno`; the
//! request dispatcher turns either into exactly one reply, so implementations never touch the
//! wire format.

use bytes::Bytes;
use log::warn;
use std::path::Path;

use crate::data::{Attr, DirEntry, Entry, Forget, KernelConfig, Open, Statfs};
use crate::ll::Errno;
use crate::request::RequestMeta;

/// Filesystem trait.
///
/// This trait must be implemented to provide a userspace filesystem via FUSE.
/// These methods correspond to `fuse_lowlevel_ops` in libfuse. Reasonable default
/// implementations are provided here to get a mountable filesystem that does
/// nothing.
///
/// Methods take `&self` so that a session may serve requests from several worker threads
/// at once; implementations keep any mutable state behind their own synchronization.
#[allow(clippy::too_many_arguments)]
#[allow(unused_variables)] // This is the main API, so variables are named without the underscore even though the defaults may not use them.
#[allow(clippy::missing_errors_doc)]
pub trait Filesystem: Send + Sync + 'static {
    /// Initialize filesystem.
    /// Called before any other filesystem method.
    /// The kernel module connection can be configured using the `KernelConfig` object.
    /// The method should return `Ok(KernelConfig)` to accept the connection, or `Err(Errno)` to reject it.
    fn init(&self, req: RequestMeta, config: KernelConfig) -> Result<KernelConfig, Errno> {
        Ok(config)
    }

    /// Clean up filesystem.
    /// Called on filesystem exit.
    fn destroy(&self) {}

    /// Look up a directory entry by name and get its attributes.
    fn lookup(&self, req: RequestMeta, parent: u64, name: &Path) -> Result<Entry, Errno> {
        warn!("[Not Implemented] lookup(parent: {parent:#x?}, name {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Forget about an inode.
    /// The `target.nlookup` parameter indicates the number of lookups previously performed on
    /// this inode. The filesystem may ignore forget calls if its inodes live for the whole
    /// session. This operation does not return a result.
    fn forget(&self, req: RequestMeta, target: Forget) {}

    /// Like forget, but take multiple forget requests at once for performance. The default
    /// implementation will fallback to `forget` for each node.
    fn batch_forget(&self, req: RequestMeta, nodes: Vec<Forget>) {
        for node in nodes {
            self.forget(req, node);
        }
    }

    /// Get file attributes.
    fn getattr(&self, req: RequestMeta, ino: u64, fh: Option<u64>) -> Result<Attr, Errno> {
        warn!("[Not Implemented] getattr(ino: {ino:#x?}, fh: {fh:#x?})");
        Err(Errno::ENOSYS)
    }

    /// Open a file.
    /// The filesystem can store a file handle in `Open.fh`; the kernel passes it back on every
    /// later operation on this open file.
    fn open(&self, req: RequestMeta, ino: u64, flags: i32) -> Result<Open, Errno> {
        warn!("[Not Implemented] open(ino: {ino:#x?}, flags: {flags})");
        Err(Errno::ENOSYS)
    }

    /// Read data.
    /// Read should return exactly the number of bytes requested except on EOF or error,
    /// otherwise the rest of the data will be substituted with zeroes.
    /// `Bytes` allows for returning borrowed or owned data, potentially avoiding data copies.
    fn read(
        &self,
        req: RequestMeta,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
    ) -> Result<Bytes, Errno> {
        warn!(
            "[Not Implemented] read(ino: {ino:#x?}, fh: {fh}, offset: {offset}, size: {size}, \
            flags: {flags:#x?}, lock_owner: {lock_owner:?})"
        );
        Err(Errno::ENOSYS)
    }

    /// Flush method.
    /// Called on each `close()` of an opened file.
    fn flush(&self, req: RequestMeta, ino: u64, fh: u64, lock_owner: u64) -> Result<(), Errno> {
        warn!("[Not Implemented] flush(ino: {ino:#x?}, fh: {fh}, lock_owner: {lock_owner:?})");
        Err(Errno::ENOSYS)
    }

    /// Release an open file.
    /// For every open call there will be exactly one release call. Error values are not
    /// returned to `close()` or `munmap()` which triggered the release.
    fn release(
        &self,
        req: RequestMeta,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
    ) -> Result<(), Errno> {
        Ok(())
    }

    /// Open a directory.
    /// The default hands out file handle 0 and keeps no per-open state.
    fn opendir(&self, req: RequestMeta, ino: u64, flags: i32) -> Result<Open, Errno> {
        Ok(Open::default())
    }

    /// Read directory.
    /// The filesystem should return the entries following `offset`, each carrying the cursor
    /// that resumes the listing right after it. The dispatcher packs as many as fit into
    /// `max_bytes` and drops the rest; an empty list indicates the end of the stream.
    fn readdir(
        &self,
        req: RequestMeta,
        ino: u64,
        fh: u64,
        offset: i64,
        max_bytes: u32,
    ) -> Result<Vec<DirEntry>, Errno> {
        warn!(
            "[Not Implemented] readdir(ino: {ino:#x?}, fh: {fh}, offset: {offset}, \
            max_bytes: {max_bytes})"
        );
        Err(Errno::ENOSYS)
    }

    /// Release an open directory.
    fn releasedir(&self, req: RequestMeta, ino: u64, fh: u64, flags: i32) -> Result<(), Errno> {
        Ok(())
    }

    /// Get file system statistics.
    fn statfs(&self, req: RequestMeta, ino: u64) -> Result<Statfs, Errno> {
        Ok(Statfs::default())
    }

    /// Check file access permissions.
    /// This will be called for the `access()` system call. If the `default_permissions`
    /// mount option is given, this method is not called.
    fn access(&self, req: RequestMeta, ino: u64, mask: i32) -> Result<(), Errno> {
        warn!("[Not Implemented] access(ino: {ino:#x?}, mask: {mask})");
        Err(Errno::ENOSYS)
    }
}
