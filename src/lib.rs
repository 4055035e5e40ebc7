//! A minimal read-only FUSE filesystem
//!
//! `hellofs` talks the FUSE kernel protocol directly (no libfuse) and serves a tiny, immutable
//! tree: a root directory holding the single file `hello`. The protocol plumbing (request
//! parsing, reply encoding, the session loop and mounting) is generic over the [`Filesystem`]
//! trait; [`HelloFs`] is the implementation that answers from a [`Namespace`].

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

use std::io;
use std::path::Path;

pub use crate::data::{
    Attr, DirEntry, Entry, FileAttr, FileType, Forget, KernelConfig, Open, Statfs,
};
pub use crate::filesystem::Filesystem;
pub use crate::hello::{read_slice, HelloFs, TTL};
pub use crate::ll::fuse_abi::FUSE_ROOT_ID;
pub use crate::ll::{fuse_abi::consts, Errno};
pub use crate::mnt::mount_options::{check_option_conflicts, MountOption};
pub use crate::namespace::{
    DirEntries, Inode, Namespace, NamespaceBuilder, HELLO_CONTENT, HELLO_INO, HELLO_NAME,
};
pub use crate::request::RequestMeta;
pub use crate::session::{Session, SessionACL, SessionUnmounter};

mod channel;
mod data;
mod filesystem;
mod hello;
mod ll;
mod mnt;
mod namespace;
mod reply;
mod request;
mod session;

/// Mount the given filesystem to the given mountpoint. This function will
/// not return until the filesystem is unmounted.
pub fn mount<FS: Filesystem, P: AsRef<Path>>(
    filesystem: FS,
    mountpoint: P,
    options: &[MountOption],
) -> io::Result<()> {
    check_option_conflicts(options)?;
    Session::new(filesystem, mountpoint.as_ref(), options).and_then(|se| se.run())
}
