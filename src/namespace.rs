//! In-memory, immutable directory tree.
//!
//! A `Namespace` is built once, then only read. Inode numbers are handed out sequentially
//! starting at the root (`FUSE_ROOT_ID`) and never change, so an inode is found by indexing.

use bytes::Bytes;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::time::SystemTime;

use crate::data::{DirEntry, FileAttr, FileType};
use crate::ll::fuse_abi::FUSE_ROOT_ID;
use crate::ll::Errno;

/// Inode of the `hello` file in [`Namespace::hello`]
pub const HELLO_INO: u64 = 2;
/// Name of the file in [`Namespace::hello`]
pub const HELLO_NAME: &str = "hello";
/// Content of the file in [`Namespace::hello`]
pub const HELLO_CONTENT: &[u8] = b"Hello, World!\n";

const BLOCK_SIZE: u32 = 512;
const DIR_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o444;

/// One file or directory
#[derive(Debug, Clone)]
pub struct Inode {
    ino: u64,
    parent: u64,
    kind: FileType,
    perm: u16,
    nlink: u32,
    content: Bytes,
    children: Vec<(OsString, u64)>,
    uid: u32,
    gid: u32,
    time: SystemTime,
}

impl Inode {
    /// Inode number
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Containing directory. The root is its own parent.
    pub fn parent(&self) -> u64 {
        self.parent
    }

    /// Directory or regular file
    pub fn kind(&self) -> FileType {
        self.kind
    }

    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// Permission bits, without the file type
    pub fn perm(&self) -> u16 {
        self.perm
    }

    /// Hard link count: 1 for files, 2 plus subdirectories for directories
    pub fn nlink(&self) -> u32 {
        self.nlink
    }

    /// Content length for files, 0 for directories
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    /// File content; empty for directories
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Attributes as reported to the kernel
    pub fn attr(&self) -> FileAttr {
        let size = self.size();
        FileAttr {
            ino: self.ino,
            size,
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: self.time,
            mtime: self.time,
            ctime: self.time,
            crtime: self.time,
            kind: self.kind,
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// The whole tree
#[derive(Debug, Clone)]
pub struct Namespace {
    inodes: Vec<Inode>,
}

impl Namespace {
    /// Start an empty tree holding only the root directory
    pub fn builder() -> NamespaceBuilder {
        NamespaceBuilder::new()
    }

    /// A root directory holding the single read-only file `hello`
    pub fn hello() -> Namespace {
        let mut builder = Self::builder();
        builder.push(FUSE_ROOT_ID, HELLO_NAME.into(), FileType::RegularFile, HELLO_CONTENT.into());
        builder.build()
    }

    /// Report every inode as owned by `uid`/`gid`
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Namespace {
        for inode in &mut self.inodes {
            inode.uid = uid;
            inode.gid = gid;
        }
        self
    }

    /// Report `time` as access, modification and change time of every inode
    pub fn with_timestamp(mut self, time: SystemTime) -> Namespace {
        for inode in &mut self.inodes {
            inode.time = time;
        }
        self
    }

    /// Number of inodes, root included. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// The root directory
    pub fn root(&self) -> &Inode {
        &self.inodes[0]
    }

    /// Metadata of `ino`, or `None` if no such inode exists
    pub fn get(&self, ino: u64) -> Option<&Inode> {
        let index = usize::try_from(ino.checked_sub(FUSE_ROOT_ID)?).ok()?;
        self.inodes.get(index)
    }

    /// The child of directory `parent` called exactly `name`. Matching is byte-for-byte and
    /// case-sensitive; `None` if `parent` is unknown, not a directory, or has no such child.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Option<&Inode> {
        let dir = self.get(parent).filter(|inode| inode.is_dir())?;
        let (_, child) = dir.children.iter().find(|(n, _)| n.as_os_str() == name)?;
        self.get(*child)
    }

    /// Listing of directory `ino`: `.`, `..`, then its children in insertion order. `None` if
    /// `ino` is unknown or not a directory.
    pub fn entries(&self, ino: u64) -> Option<DirEntries<'_>> {
        let dir = self.get(ino).filter(|inode| inode.is_dir())?;
        Some(DirEntries {
            namespace: self,
            dir,
            pos: 0,
        })
    }
}

/// Iterator over a directory listing. Each entry carries the cursor of the entry after it,
/// so `entries(ino)?.skip(cursor)` resumes a listing.
#[derive(Debug, Clone)]
pub struct DirEntries<'a> {
    namespace: &'a Namespace,
    dir: &'a Inode,
    pos: usize,
}

impl DirEntries<'_> {
    fn total(&self) -> usize {
        self.dir.children.len() + 2
    }
}

impl Iterator for DirEntries<'_> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let (ino, name): (u64, &OsStr) = match self.pos {
            0 => (self.dir.ino, OsStr::new(".")),
            1 => (self.dir.parent, OsStr::new("..")),
            n => {
                let (name, ino) = self.dir.children.get(n - 2)?;
                (*ino, name.as_os_str())
            }
        };
        let kind = self.namespace.get(ino)?.kind;
        self.pos += 1;
        Some(DirEntry {
            ino,
            offset: self.pos as i64,
            kind,
            name: name.to_os_string(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total().saturating_sub(self.pos);
        (left, Some(left))
    }

    fn nth(&mut self, n: usize) -> Option<DirEntry> {
        self.pos = self.pos.saturating_add(n);
        self.next()
    }
}

impl ExactSizeIterator for DirEntries<'_> {}

/// Assembles a [`Namespace`]
#[derive(Debug)]
pub struct NamespaceBuilder {
    inodes: Vec<Inode>,
    uid: u32,
    gid: u32,
    time: SystemTime,
}

impl NamespaceBuilder {
    fn new() -> Self {
        let mut builder = NamespaceBuilder {
            inodes: Vec::new(),
            uid: 0,
            gid: 0,
            time: SystemTime::UNIX_EPOCH,
        };
        builder.inodes.push(Inode {
            ino: FUSE_ROOT_ID,
            parent: FUSE_ROOT_ID,
            kind: FileType::Directory,
            perm: DIR_PERM,
            nlink: 2,
            content: Bytes::new(),
            children: Vec::new(),
            uid: 0,
            gid: 0,
            time: SystemTime::UNIX_EPOCH,
        });
        builder
    }

    /// Owner reported for every inode
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Timestamp reported for every inode
    pub fn timestamp(mut self, time: SystemTime) -> Self {
        self.time = time;
        self
    }

    /// Add a read-only file below directory `parent` and return its inode number
    pub fn file(
        &mut self,
        parent: u64,
        name: impl Into<OsString>,
        content: impl Into<Bytes>,
    ) -> Result<u64, Errno> {
        let name = name.into();
        self.check_new_child(parent, &name)?;
        Ok(self.push(parent, name, FileType::RegularFile, content.into()))
    }

    /// Add an empty directory below directory `parent` and return its inode number
    pub fn dir(&mut self, parent: u64, name: impl Into<OsString>) -> Result<u64, Errno> {
        let name = name.into();
        self.check_new_child(parent, &name)?;
        Ok(self.push(parent, name, FileType::Directory, Bytes::new()))
    }

    /// Freeze the tree
    pub fn build(self) -> Namespace {
        Namespace {
            inodes: self.inodes,
        }
        .with_owner(self.uid, self.gid)
        .with_timestamp(self.time)
    }

    fn index(ino: u64) -> usize {
        (ino - FUSE_ROOT_ID) as usize
    }

    fn check_new_child(&self, parent: u64, name: &OsStr) -> Result<(), Errno> {
        let bytes = name.as_bytes();
        if matches!(bytes, b"" | b"." | b"..") || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(Errno::EINVAL);
        }
        let dir = match parent.checked_sub(FUSE_ROOT_ID) {
            Some(index) => self.inodes.get(index as usize).ok_or(Errno::ENOENT)?,
            None => return Err(Errno::ENOENT),
        };
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if dir.children.iter().any(|(n, _)| n.as_os_str() == name) {
            return Err(Errno::EEXIST);
        }
        Ok(())
    }

    /// Append an inode; `parent` must be a known directory without a child called `name`
    fn push(&mut self, parent: u64, name: OsString, kind: FileType, content: Bytes) -> u64 {
        let ino = FUSE_ROOT_ID + self.inodes.len() as u64;
        let (perm, nlink) = match kind {
            FileType::Directory => (DIR_PERM, 2),
            _ => (FILE_PERM, 1),
        };
        self.inodes.push(Inode {
            ino,
            parent,
            kind,
            perm,
            nlink,
            content,
            children: Vec::new(),
            uid: self.uid,
            gid: self.gid,
            time: self.time,
        });
        let dir = &mut self.inodes[Self::index(parent)];
        dir.children.push((name, ino));
        if kind == FileType::Directory {
            dir.nlink += 1;
        }
        ino
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn names(entries: impl Iterator<Item = DirEntry>) -> Vec<(OsString, u64, i64)> {
        entries.map(|e| (e.name, e.ino, e.offset)).collect()
    }

    #[test]
    fn hello_tree() {
        let ns = Namespace::hello();
        assert_eq!(ns.len(), 2);
        let root = ns.get(FUSE_ROOT_ID).unwrap();
        assert!(root.is_dir());
        assert_eq!((root.perm(), root.nlink(), root.size()), (0o755, 2, 0));
        assert_eq!(root.parent(), FUSE_ROOT_ID);
        let hello = ns.get(HELLO_INO).unwrap();
        assert_eq!(hello.kind(), FileType::RegularFile);
        assert_eq!((hello.perm(), hello.nlink(), hello.size()), (0o444, 1, 14));
        assert_eq!(&hello.content()[..], b"Hello, World!\n");
    }

    #[test]
    fn unknown_inodes() {
        let ns = Namespace::hello();
        assert!(ns.get(0).is_none());
        assert!(ns.get(3).is_none());
        assert!(ns.get(u64::MAX).is_none());
    }

    #[test]
    fn lookup_is_exact() {
        let ns = Namespace::hello();
        assert_eq!(ns.lookup(FUSE_ROOT_ID, OsStr::new("hello")).unwrap().ino(), HELLO_INO);
        assert!(ns.lookup(FUSE_ROOT_ID, OsStr::new("Hello")).is_none());
        assert!(ns.lookup(FUSE_ROOT_ID, OsStr::new("hell")).is_none());
        assert!(ns.lookup(FUSE_ROOT_ID, OsStr::new("nope")).is_none());
        assert!(ns.lookup(HELLO_INO, OsStr::new("hello")).is_none());
        assert!(ns.lookup(42, OsStr::new("hello")).is_none());
    }

    #[test]
    fn root_listing() {
        let ns = Namespace::hello();
        assert_eq!(
            names(ns.entries(FUSE_ROOT_ID).unwrap()),
            vec![
                (".".into(), 1, 1),
                ("..".into(), 1, 2),
                ("hello".into(), 2, 3),
            ]
        );
        assert_eq!(ns.entries(FUSE_ROOT_ID).unwrap().len(), 3);
        assert!(ns.entries(HELLO_INO).is_none());
        assert!(ns.entries(7).is_none());
    }

    #[test]
    fn listing_resumes_from_cursor() {
        let ns = Namespace::hello();
        let rest = names(ns.entries(FUSE_ROOT_ID).unwrap().skip(2));
        assert_eq!(rest, vec![("hello".into(), 2, 3)]);
        assert_eq!(ns.entries(FUSE_ROOT_ID).unwrap().skip(3).count(), 0);
        assert_eq!(ns.entries(FUSE_ROOT_ID).unwrap().skip(usize::MAX).count(), 0);
    }

    #[test]
    fn nested_tree() {
        let mut builder = Namespace::builder().owner(1000, 100);
        let sub = builder.dir(FUSE_ROOT_ID, "sub").unwrap();
        let file = builder.file(sub, "data", &b"abc"[..]).unwrap();
        let ns = builder.build();
        assert_eq!((sub, file), (2, 3));
        assert_eq!(ns.root().nlink(), 3);
        assert_eq!(ns.lookup(sub, OsStr::new("data")).unwrap().ino(), file);
        let listing = names(ns.entries(sub).unwrap());
        assert_eq!(listing[1], ("..".into(), FUSE_ROOT_ID, 2));
        let attr = ns.get(file).unwrap().attr();
        assert_eq!((attr.uid, attr.gid, attr.size, attr.blocks), (1000, 100, 3, 1));
    }

    #[test]
    fn builder_rejects_bad_children() {
        let mut builder = Namespace::builder();
        let file = builder.file(FUSE_ROOT_ID, "a", Bytes::new()).unwrap();
        assert_eq!(builder.file(FUSE_ROOT_ID, "a", Bytes::new()), Err(Errno::EEXIST));
        assert_eq!(builder.file(file, "b", Bytes::new()), Err(Errno::ENOTDIR));
        assert_eq!(builder.dir(99, "c"), Err(Errno::ENOENT));
        assert_eq!(builder.dir(FUSE_ROOT_ID, ".."), Err(Errno::EINVAL));
        assert_eq!(builder.dir(FUSE_ROOT_ID, "x/y"), Err(Errno::EINVAL));
    }

    #[test]
    fn attributes_follow_owner_and_timestamp() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let ns = Namespace::hello().with_owner(7, 8).with_timestamp(time);
        let attr = ns.get(HELLO_INO).unwrap().attr();
        assert_eq!((attr.uid, attr.gid), (7, 8));
        assert_eq!(attr.mtime, time);
        assert_eq!(attr.blksize, 512);
        assert_eq!(attr.blocks, 1);
        assert_eq!(ns.root().attr().blocks, 0);
    }
}
