//! Mounting and unmounting the filesystem.
//!
//! Privileged processes mount `/dev/fuse` directly. Everybody else goes through the setuid
//! `fusermount3` (or `fusermount`) helper, which hands the opened device back over a socket.

mod fuse_pure;
pub mod mount_options;

use log::debug;
use std::fs::File;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use mount_options::MountOption;

/// A mounted filesystem. Dropping it unmounts.
#[derive(Debug)]
pub(crate) struct Mount {
    mountpoint: PathBuf,
    /// Held open while fusermount waits to auto-unmount
    auto_unmount_socket: Option<UnixStream>,
}

impl Mount {
    /// Mount at `mountpoint`, returning the opened FUSE device along with the mount handle
    pub(crate) fn new(mountpoint: &Path, options: &[MountOption]) -> io::Result<(File, Mount)> {
        let mountpoint = mountpoint.canonicalize()?;
        let (file, auto_unmount_socket) = fuse_pure::fuse_mount_pure(&mountpoint, options)?;
        debug!("mounted {}", mountpoint.display());
        Ok((
            file,
            Mount {
                mountpoint,
                auto_unmount_socket,
            },
        ))
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Some(sock) = self.auto_unmount_socket.take() {
            // fusermount unmounts once its end of the socket closes
            drop(sock);
            return;
        }
        fuse_pure::fuse_unmount_pure(&self.mountpoint);
    }
}
