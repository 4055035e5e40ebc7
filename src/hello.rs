//! The read-only filesystem served by `hellofs`.
//!
//! Every operation is a lookup against an immutable [`Namespace`]; nothing is ever written, so
//! the handlers share no mutable state and may run concurrently.

use bytes::Bytes;
use log::debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Attr, DirEntry, Entry, Open};
use crate::filesystem::Filesystem;
use crate::ll::Errno;
use crate::namespace::{Inode, Namespace};
use crate::request::RequestMeta;

/// How long the kernel may cache names and attributes
pub const TTL: Duration = Duration::from_secs(1);

/// Serves a [`Namespace`] through the `Filesystem` trait
#[derive(Debug, Clone)]
pub struct HelloFs {
    namespace: Arc<Namespace>,
}

impl HelloFs {
    /// Serve `namespace`, which may be shared with other filesystems
    pub fn new(namespace: Arc<Namespace>) -> HelloFs {
        HelloFs { namespace }
    }

    /// The tree being served
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn file(&self, ino: u64) -> Result<&Inode, Errno> {
        self.namespace
            .get(ino)
            .filter(|inode| !inode.is_dir())
            .ok_or(Errno::ENOENT)
    }
}

impl Default for HelloFs {
    fn default() -> Self {
        HelloFs::new(Arc::new(Namespace::hello()))
    }
}

/// The part of `content` covered by a read of `size` bytes at `offset`. Empty at or past the
/// end, and for negative offsets.
pub fn read_slice(content: &Bytes, offset: i64, size: u32) -> Bytes {
    let Ok(start) = usize::try_from(offset) else {
        return Bytes::new();
    };
    if start >= content.len() {
        return Bytes::new();
    }
    let end = start.saturating_add(size as usize).min(content.len());
    content.slice(start..end)
}

impl Filesystem for HelloFs {
    fn lookup(&self, _req: RequestMeta, parent: u64, name: &Path) -> Result<Entry, Errno> {
        let inode = self
            .namespace
            .lookup(parent, name.as_os_str())
            .ok_or(Errno::ENOENT)?;
        Ok(Entry {
            attr: inode.attr(),
            ttl: TTL,
            generation: 0,
        })
    }

    fn getattr(&self, _req: RequestMeta, ino: u64, _fh: Option<u64>) -> Result<Attr, Errno> {
        let inode = self.namespace.get(ino).ok_or(Errno::ENOENT)?;
        Ok(Attr {
            attr: inode.attr(),
            ttl: TTL,
        })
    }

    fn open(&self, _req: RequestMeta, ino: u64, _flags: i32) -> Result<Open, Errno> {
        self.file(ino)?;
        Ok(Open::default())
    }

    fn read(
        &self,
        _req: RequestMeta,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
    ) -> Result<Bytes, Errno> {
        let inode = self.file(ino)?;
        Ok(read_slice(inode.content(), offset, size))
    }

    fn opendir(&self, _req: RequestMeta, ino: u64, _flags: i32) -> Result<Open, Errno> {
        match self.namespace.get(ino) {
            Some(inode) if inode.is_dir() => Ok(Open::default()),
            _ => Err(Errno::ENOENT),
        }
    }

    fn readdir(
        &self,
        _req: RequestMeta,
        ino: u64,
        _fh: u64,
        offset: i64,
        _max_bytes: u32,
    ) -> Result<Vec<DirEntry>, Errno> {
        let entries = self.namespace.entries(ino).ok_or(Errno::ENOENT)?;
        let Ok(skip) = usize::try_from(offset) else {
            debug!("readdir(ino: {ino:#x?}) with negative offset {offset}");
            return Ok(Vec::new());
        };
        Ok(entries.skip(skip).collect())
    }
}
