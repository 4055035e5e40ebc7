//! Filesystem operation request
//!
//! A request represents information about a filesystem operation the kernel driver wants us to
//! perform. `RequestHandler` pairs the parsed request with the handler owed its reply and
//! routes it to the matching `Filesystem` method.

use crate::ll::{fuse_abi as abi, Errno};
use log::{debug, error, warn};
use std::sync::atomic::Ordering;

use crate::data::{Forget, KernelConfig};
use crate::ll;
use crate::reply::{ReplyHandler, ReplySender};
use crate::session::{SessionACL, SessionMeta};
use crate::Filesystem;

/// Request data structure
#[derive(Debug)]
pub struct RequestHandler {
    /// Parsed request
    request: ll::AnyRequest,
    /// Request metadata
    meta: RequestMeta,
    /// Closure-like object to guarantee a response is sent
    replyhandler: ReplyHandler,
}

/// Request metadata structure
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RequestMeta {
    /// The unique identifier of this request
    pub unique: u64,
    /// The uid of this request
    pub uid: u32,
    /// The gid of this request
    pub gid: u32,
    /// The pid of this request
    pub pid: u32,
}

impl RequestHandler {
    /// Create a new request from the given data. Returns `None` if the data is not a well
    /// formed request; there is nobody to reply to in that case.
    pub(crate) fn new<S: ReplySender>(sender: S, data: Vec<u8>) -> Option<RequestHandler> {
        let request = match ll::AnyRequest::try_from(data) {
            Ok(request) => request,
            Err(err) => {
                error!("{err}");
                return None;
            }
        };

        let meta = RequestMeta {
            unique: request.unique().into(),
            uid: request.uid(),
            gid: request.gid(),
            pid: request.pid(),
        };
        let replyhandler = ReplyHandler::new(request.unique().into(), sender);
        Some(Self {
            request,
            meta,
            replyhandler,
        })
    }

    /// Dispatch request to the given filesystem.
    /// This calls the appropriate filesystem operation method for the
    /// request and sends back the returned reply to the kernel
    pub(crate) fn dispatch<FS: Filesystem>(self, fs: &FS, se_meta: &SessionMeta) {
        debug!("{}", self.request);
        let op = match self.request.operation() {
            Ok(op) => op,
            Err(err) => {
                warn!("Ignoring FUSE request {}: {err}", self.meta.unique);
                self.replyhandler.error(Errno::ENOSYS);
                return;
            }
        };

        // Implement allow_root & access check for auto_unmount
        if access_denied(se_meta, self.request.uid(), &op) {
            self.replyhandler.error(Errno::EACCES);
            return;
        }
        let initialized = se_meta.initialized.load(Ordering::SeqCst);
        let destroyed = se_meta.destroyed.load(Ordering::SeqCst);

        match op {
            // Filesystem initialization
            ll::Operation::Init(x) => {
                // We don't support ABI versions before 7.6
                let v = x.version();
                if v < ll::Version(7, 6) {
                    error!("Unsupported FUSE ABI version {v}");
                    self.replyhandler.error(Errno::EPROTO);
                    return;
                }
                // Remember ABI version supported by kernel
                se_meta.proto_major.store(v.major(), Ordering::SeqCst);
                se_meta.proto_minor.store(v.minor(), Ordering::SeqCst);

                let config = KernelConfig::new(x.capabilities(), x.max_readahead());
                // Call filesystem init method and give it a chance to
                // propose a different config or return an error
                match fs.init(self.meta, config) {
                    Ok(config) => {
                        // Reply with our desired version and settings. If the kernel supports a
                        // larger major version, it'll re-send a matching init message. If it
                        // supports only lower major versions, we replied with an error above.
                        let flags = x.capabilities() & config.requested();
                        debug!(
                            "INIT response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
                            abi::FUSE_KERNEL_VERSION,
                            abi::FUSE_KERNEL_MINOR_VERSION,
                            flags,
                            config.max_readahead,
                            config.max_write
                        );
                        se_meta.initialized.store(true, Ordering::SeqCst);
                        self.replyhandler.config(&config.into_fuse_init_out(flags));
                    }
                    Err(errno) => {
                        // Filesystem refused the config.
                        self.replyhandler.error(errno);
                    }
                }
            }
            // Any operation is invalid before initialization
            _ if !initialized => {
                warn!("Ignoring FUSE operation before init: {}", self.request);
                self.replyhandler.error(Errno::EIO);
            }
            // Filesystem destroyed
            ll::Operation::Destroy => {
                fs.destroy();
                se_meta.destroyed.store(true, Ordering::SeqCst);
                self.replyhandler.ok();
            }
            // Any operation is invalid after destroy
            _ if destroyed => {
                warn!("Ignoring FUSE operation after destroy: {}", self.request);
                self.replyhandler.error(Errno::EIO);
            }
            ll::Operation::Interrupt(x) => {
                // Every operation completes synchronously, so there is never anything to cancel
                debug!("Interrupt for {:?} has nothing to cancel", x.unique());
                self.replyhandler.error(Errno::ENOSYS);
            }

            ll::Operation::Lookup(x) => {
                match fs.lookup(self.meta, self.request.nodeid().into(), x.name()) {
                    Ok(entry) => self.replyhandler.entry(entry),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Forget(x) => {
                let target = Forget {
                    ino: self.request.nodeid().into(),
                    nlookup: x.nlookup(),
                };
                fs.forget(self.meta, target);
                self.replyhandler.disable(); // no reply
            }
            ll::Operation::BatchForget(x) => {
                let nodes = x
                    .nodes()
                    .iter()
                    .map(|node| Forget {
                        ino: node.nodeid,
                        nlookup: node.nlookup,
                    })
                    .collect();
                fs.batch_forget(self.meta, nodes);
                self.replyhandler.disable(); // no reply
            }
            ll::Operation::GetAttr(x) => {
                match fs.getattr(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().map(Into::into),
                ) {
                    Ok(attr) => self.replyhandler.attr(attr),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Open(x) => {
                match fs.open(self.meta, self.request.nodeid().into(), x.flags()) {
                    Ok(open) => self.replyhandler.opened(open),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Read(x) => {
                let response = fs.read(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().into(),
                    x.offset(),
                    x.size(),
                    x.flags(),
                    x.lock_owner().map(Into::into),
                );
                match response {
                    Ok(data) => {
                        // The kernel rejects replies longer than what it asked for
                        let len = data.len().min(x.size() as usize);
                        self.replyhandler.data(&data[..len]);
                    }
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::StatFs => {
                match fs.statfs(self.meta, self.request.nodeid().into()) {
                    Ok(statfs) => self.replyhandler.statfs(statfs),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Release(x) => {
                let response = fs.release(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().into(),
                    x.flags(),
                    x.lock_owner().map(Into::into),
                    x.flush(),
                );
                match response {
                    Ok(()) => self.replyhandler.ok(),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Flush(x) => {
                let response = fs.flush(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().into(),
                    x.lock_owner().into(),
                );
                match response {
                    Ok(()) => self.replyhandler.ok(),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::OpenDir(x) => {
                match fs.opendir(self.meta, self.request.nodeid().into(), x.flags()) {
                    Ok(open) => self.replyhandler.opened(open),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::ReadDir(x) => {
                let response = fs.readdir(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().into(),
                    x.offset(),
                    x.size(),
                );
                match response {
                    Ok(entries) => self.replyhandler.dir(&entries, x.size() as usize),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::ReleaseDir(x) => {
                let response = fs.releasedir(
                    self.meta,
                    self.request.nodeid().into(),
                    x.file_handle().into(),
                    x.flags(),
                );
                match response {
                    Ok(()) => self.replyhandler.ok(),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Access(x) => {
                match fs.access(self.meta, self.request.nodeid().into(), x.mask()) {
                    Ok(()) => self.replyhandler.ok(),
                    Err(err) => self.replyhandler.error(err),
                }
            }
            ll::Operation::Unsupported(opcode) => {
                warn!("[Not Implemented] {opcode:?}");
                self.replyhandler.error(Errno::ENOSYS);
            }
        }
    }
}

/// Whether the session's ACL forbids user `uid` this operation
fn access_denied(se_meta: &SessionMeta, uid: u32, op: &ll::Operation<'_>) -> bool {
    let restricted = match se_meta.allowed {
        SessionACL::All => false,
        SessionACL::RootAndOwner => uid != se_meta.session_owner && uid != 0,
        SessionACL::Owner => uid != se_meta.session_owner,
    };
    // Only allow operations that the kernel may issue without a uid set
    restricted
        && !matches!(
            op,
            ll::Operation::Init(_)
                | ll::Operation::Destroy
                | ll::Operation::Read(_)
                | ll::Operation::ReadDir(_)
                | ll::Operation::Forget(_)
                | ll::Operation::BatchForget(_)
                | ll::Operation::Release(_)
                | ll::Operation::ReleaseDir(_)
                | ll::Operation::Interrupt(_)
        )
}
