//! Filesystem session
//!
//! A session runs a filesystem implementation while it is being mounted to a specific mount
//! point. A session begins by mounting the filesystem and ends by unmounting it. While the
//! filesystem is mounted, the session loop receives, dispatches and replies to kernel requests
//! for filesystem operations under its mount point.

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{debug, error, info, warn};
use nix::unistd::geteuid;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::channel::Channel;
use crate::mnt::Mount;
use crate::request::RequestHandler;
use crate::{Filesystem, MountOption};

/// The max size of write requests from the kernel. The absolute minimum is 4k and FUSE
/// recommends at least 128k. Nothing is ever written to this filesystem, so the minimum
/// recommendation is plenty.
pub const MAX_WRITE_SIZE: usize = 128 * 1024;

/// Size of the buffer for reading a request from the kernel. Since the kernel may send
/// up to `MAX_WRITE_SIZE` bytes in a write request, we use that value plus some extra space.
pub const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

#[derive(Default, Eq, PartialEq, Debug, Clone, Copy)]
/// How requests should be filtered based on the calling UID.
pub enum SessionACL {
    /// Allow requests from any user. Corresponds to the `allow_other` mount option.
    All,
    /// Allow requests from root. Corresponds to the `allow_root` mount option.
    RootAndOwner,
    /// Allow requests from the owning UID. This is FUSE's default mode of operation.
    #[default]
    Owner,
}

/// Session metadata
#[derive(Debug)]
pub(crate) struct SessionMeta {
    /// Whether to restrict access to owner, root + owner, or unrestricted
    /// Used to implement allow_root and auto_unmount
    pub(crate) allowed: SessionACL,
    /// User that launched the process
    pub(crate) session_owner: u32,
    /// FUSE protocol major version
    pub(crate) proto_major: AtomicU32,
    /// FUSE protocol minor version
    pub(crate) proto_minor: AtomicU32,
    /// True if the filesystem is initialized (init operation done)
    pub(crate) initialized: AtomicBool,
    /// True if the filesystem was destroyed (destroy operation done)
    pub(crate) destroyed: AtomicBool,
}

impl SessionMeta {
    pub(crate) fn new(allowed: SessionACL, session_owner: u32) -> Self {
        SessionMeta {
            allowed,
            session_owner,
            proto_major: AtomicU32::new(0),
            proto_minor: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }
}

type SharedMount = Arc<Mutex<Option<(PathBuf, Mount)>>>;

fn lock_mount(mount: &SharedMount) -> MutexGuard<'_, Option<(PathBuf, Mount)>> {
    // The guarded value is only ever replaced whole, so a poisoned lock still holds a
    // consistent value
    mount.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The session data structure
#[derive(Debug)]
pub struct Session<FS: Filesystem> {
    /// Filesystem operation implementations
    filesystem: FS,
    /// Communication channel to the kernel driver
    ch: Channel,
    /// Handle to the mount. Dropping this unmounts.
    mount: SharedMount,
    /// Number of threads dispatching requests
    workers: usize,
    meta: SessionMeta,
}

impl<FS: Filesystem> Session<FS> {
    /// Create a new session by mounting the given filesystem to the given mountpoint
    pub fn new<P: AsRef<Path>>(
        filesystem: FS,
        mountpoint: P,
        options: &[MountOption],
    ) -> io::Result<Session<FS>> {
        let mountpoint = mountpoint.as_ref();
        info!("Mounting {}", mountpoint.display());
        // Create the channel for fuse messages
        let (file, mount) = if options.contains(&MountOption::AutoUnmount)
            && !(options.contains(&MountOption::AllowRoot)
                || options.contains(&MountOption::AllowOther))
        {
            // If AutoUnmount is requested, but not AllowRoot or AllowOther we enforce the ACL
            // ourself and implicitly set AllowOther because fusermount needs allow_root or allow_other
            // to handle the auto_unmount option
            warn!(
                "Given auto_unmount without allow_root or allow_other; adding allow_other, with userspace permission handling"
            );
            let mut modified_options = options.to_vec();
            modified_options.push(MountOption::AllowOther);
            Mount::new(mountpoint, &modified_options)?
        } else {
            Mount::new(mountpoint, options)?
        };
        let allowed = if options.contains(&MountOption::AllowRoot) {
            SessionACL::RootAndOwner
        } else if options.contains(&MountOption::AllowOther) {
            SessionACL::All
        } else {
            SessionACL::Owner
        };
        Ok(Session {
            filesystem,
            ch: Channel::new(file),
            mount: Arc::new(Mutex::new(Some((mountpoint.to_owned(), mount)))),
            workers: 1,
            meta: SessionMeta::new(allowed, geteuid().as_raw()),
        })
    }

    /// Wrap an existing /dev/fuse file descriptor. This doesn't mount the
    /// filesystem anywhere; that must be done separately.
    pub fn from_fd(filesystem: FS, fd: OwnedFd, acl: SessionACL) -> Session<FS> {
        Session {
            filesystem,
            ch: Channel::new(fd.into()),
            mount: Arc::new(Mutex::new(None)),
            workers: 1,
            meta: SessionMeta::new(acl, geteuid().as_raw()),
        }
    }

    /// Dispatch requests on `workers` threads. One (the default) serves every request on the
    /// thread calling `run`.
    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers.max(1);
    }

    /// Run the session loop that receives kernel requests and dispatches them to method calls
    /// into the filesystem. Returns once the filesystem is unmounted.
    pub fn run(&self) -> io::Result<()> {
        info!("Starting request loop with {} worker(s)", self.workers);
        if self.workers == 1 {
            return self.do_requests(|req| req.dispatch(&self.filesystem, &self.meta));
        }
        let (tx, rx) = crossbeam_channel::bounded::<RequestHandler>(self.workers * 2);
        thread::scope(|scope| {
            // Owned by this closure so it is dropped on every exit path, before the scope
            // joins the workers; otherwise they would wait on `rx` forever
            let tx = tx;
            for i in 0..self.workers {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("fuse-worker-{i}"))
                    .spawn_scoped(scope, move || {
                        for req in rx.iter() {
                            req.dispatch(&self.filesystem, &self.meta);
                        }
                        debug!("Worker {i} done");
                    })?;
            }
            drop(rx);
            let result = self.do_requests(|req| {
                // The kernel waits for the INIT reply before sending anything else, so INIT
                // is served here and never races the requests that follow it
                if !self.meta.initialized.load(Ordering::SeqCst) {
                    req.dispatch(&self.filesystem, &self.meta);
                } else if let Err(err) = tx.send(req) {
                    // All workers are gone; the request's reply handler answers EIO on drop
                    error!("Failed to hand request to a worker: {err}");
                }
            });
            // Lets the workers drain the queue and exit
            drop(tx);
            result
        })
    }

    fn do_requests<F: FnMut(RequestHandler)>(&self, mut handle: F) -> io::Result<()> {
        // Buffer for receiving requests from the kernel. Only one is allocated and
        // it is reused immediately after dispatching to conserve memory and allocations.
        let mut buffer = vec![0; BUFFER_SIZE];
        loop {
            // Read the next request from the given channel to kernel driver
            // The kernel driver makes sure that we get exactly one request per read
            match self.ch.receive(&mut buffer) {
                Ok(data) => match RequestHandler::new(self.ch.clone(), data) {
                    // Request is valid
                    Some(req) => handle(req),
                    // Illegal request, the channel can no longer be trusted
                    None => break,
                },
                Err(err) => match err.raw_os_error() {
                    // Operation interrupted. Accordingly to FUSE, this is safe to retry
                    Some(ENOENT) => continue,
                    // Interrupted system call, retry
                    Some(EINTR) => continue,
                    // Explicitly try again
                    Some(EAGAIN) => continue,
                    // Filesystem was unmounted, quit the loop
                    Some(ENODEV) => break,
                    // Unhandled error
                    _ => return Err(err),
                },
            }
        }
        Ok(())
    }

    /// Unmount the filesystem
    pub fn unmount(&mut self) {
        drop(lock_mount(&self.mount).take());
    }

    /// Returns a thread-safe object that can be used to unmount the Filesystem
    pub fn unmount_callable(&mut self) -> SessionUnmounter {
        SessionUnmounter {
            mount: self.mount.clone(),
        }
    }
}

#[derive(Debug)]
/// A thread-safe object that can be used to unmount a Filesystem
pub struct SessionUnmounter {
    mount: SharedMount,
}

impl SessionUnmounter {
    /// Unmount the filesystem
    pub fn unmount(&mut self) -> io::Result<()> {
        drop(lock_mount(&self.mount).take());
        Ok(())
    }
}

impl<FS: Filesystem> Drop for Session<FS> {
    fn drop(&mut self) {
        if !self.meta.destroyed.swap(true, Ordering::SeqCst) {
            self.filesystem.destroy();
        }
        if let Some((mountpoint, _mount)) = lock_mount(&self.mount).take() {
            info!("unmounting session at {}", mountpoint.display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hello::HelloFs;
    use crate::ll::fuse_abi as abi;
    use crate::ll::request::test_util::{init_in, request_bytes, struct_bytes};
    use std::os::unix::net::UnixDatagram;
    use zerocopy::FromBytes;

    /// A datagram socket keeps request boundaries the way /dev/fuse does
    fn kernel_pair() -> (UnixDatagram, OwnedFd) {
        let (kernel, fuse) = UnixDatagram::pair().unwrap();
        (kernel, OwnedFd::from(fuse))
    }

    fn replies(kernel: &UnixDatagram, count: usize) -> Vec<abi::fuse_out_header> {
        let mut buf = vec![0u8; 4096];
        (0..count)
            .map(|_| {
                let n = kernel.recv(&mut buf).unwrap();
                let header = abi::fuse_out_header::read_from_prefix(&buf[..n]).unwrap().0;
                assert_eq!(header.len as usize, n);
                header
            })
            .collect()
    }

    #[test]
    fn serves_until_channel_breaks() {
        let (kernel, fuse) = kernel_pair();
        kernel
            .send(&request_bytes(26, 1, 0, &struct_bytes(&init_in(7, 31))))
            .unwrap();
        kernel.send(&request_bytes(3, 2, 1, &[0u8; 16])).unwrap();
        kernel.send(&request_bytes(1, 3, 1, b"nope\0")).unwrap();
        // Too short to be a request
        kernel.send(&[0u8; 4]).unwrap();

        let session = Session::from_fd(HelloFs::default(), fuse, SessionACL::All);
        session.run().unwrap();

        let headers = replies(&kernel, 3);
        assert_eq!(headers.iter().map(|h| h.unique).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(headers[0].error, 0);
        assert_eq!(headers[1].error, 0);
        assert_eq!(headers[2].error, -libc::ENOENT);
    }

    #[test]
    fn worker_pool_answers_every_request() {
        let (kernel, fuse) = kernel_pair();
        kernel
            .send(&request_bytes(26, 1, 0, &struct_bytes(&init_in(7, 31))))
            .unwrap();
        for unique in 2..22 {
            kernel.send(&request_bytes(3, unique, 2, &[0u8; 16])).unwrap();
        }
        kernel.send(&[0u8; 4]).unwrap();

        let mut session = Session::from_fd(HelloFs::default(), fuse, SessionACL::All);
        session.set_workers(4);
        session.run().unwrap();

        let headers = replies(&kernel, 21);
        assert_eq!(headers[0].unique, 1);
        let mut uniques: Vec<u64> = headers.iter().map(|h| h.unique).collect();
        uniques.sort_unstable();
        assert_eq!(uniques, (1..22).collect::<Vec<u64>>());
        assert!(headers.iter().all(|h| h.error == 0));
    }

    #[test]
    fn worker_pool_returns_when_channel_breaks() {
        let (kernel, fuse) = kernel_pair();
        kernel
            .send(&request_bytes(26, 1, 0, &struct_bytes(&init_in(7, 31))))
            .unwrap();
        kernel.send(&request_bytes(3, 2, 1, &[0u8; 16])).unwrap();
        kernel.send(&[0u8; 4]).unwrap();

        let mut session = Session::from_fd(HelloFs::default(), fuse, SessionACL::All);
        session.set_workers(3);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let result = session.run();
            done_tx.send(result.is_ok()).unwrap();
        });
        let finished = done_rx.recv_timeout(std::time::Duration::from_secs(30));
        assert_eq!(finished, Ok(true), "worker pool did not shut down");
        assert_eq!(replies(&kernel, 2).len(), 2);
    }

    #[test]
    fn unmounter_without_mount_is_harmless() {
        let (_kernel, fuse) = kernel_pair();
        let mut session = Session::from_fd(HelloFs::default(), fuse, SessionACL::Owner);
        let mut unmounter = session.unmount_callable();
        unmounter.unmount().unwrap();
        session.unmount();
    }
}
