//! Low-level filesystem operation request.
//!
//! A request represents information about a filesystem operation the kernel driver wants us to
//! perform. Parsing never panics on malformed input: every shortfall is reported as a
//! `RequestError`.

use super::argument::ArgumentIterator;
use super::fuse_abi::{self as abi, consts, fuse_opcode};
use super::{FileHandle, INodeNo, LockOwner, RequestId, Version};
use std::convert::TryFrom;
use std::fmt::{self, Display};
use std::mem::size_of;
use std::path::Path;
use zerocopy::FromBytes;

/// Error that may occur while reading and parsing a request from the kernel driver.
#[derive(Debug)]
pub enum RequestError {
    /// Not enough data for parsing header (short read).
    ShortReadHeader(usize),
    /// Kernel requested an unknown operation.
    UnknownOperation(u32),
    /// Not enough data for arguments (short read).
    ShortRead(usize, usize),
    /// Insufficient argument data.
    InsufficientData,
}

impl Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(
                f,
                "Short read of FUSE request header ({len} < {})",
                size_of::<abi::fuse_in_header>()
            ),
            RequestError::UnknownOperation(opcode) => write!(f, "Unknown FUSE opcode ({opcode})"),
            RequestError::ShortRead(len, total) => {
                write!(f, "Short read of FUSE request ({len} < {total})")
            }
            RequestError::InsufficientData => write!(f, "Insufficient argument data"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Look up a directory entry by name
#[derive(Debug)]
pub struct Lookup<'a> {
    name: &'a Path,
}
impl<'a> Lookup<'a> {
    pub fn name(&self) -> &'a Path {
        self.name
    }
}

/// The kernel dropped `nlookup` references to an inode. Never answered.
#[derive(Debug)]
pub struct Forget {
    arg: abi::fuse_forget_in,
}
impl Forget {
    pub fn nlookup(&self) -> u64 {
        self.arg.nlookup
    }
}

/// Several `Forget`s in one message. Never answered.
#[derive(Debug)]
pub struct BatchForget {
    nodes: Vec<abi::fuse_forget_one>,
}
impl BatchForget {
    pub fn nodes(&self) -> &[abi::fuse_forget_one] {
        &self.nodes
    }
}

#[derive(Debug)]
pub struct GetAttr {
    arg: Option<abi::fuse_getattr_in>,
}
impl GetAttr {
    /// The handle of an open file, if the kernel issued this getattr on one
    pub fn file_handle(&self) -> Option<FileHandle> {
        match self.arg {
            Some(arg) if arg.getattr_flags & consts::FUSE_GETATTR_FH != 0 => {
                Some(FileHandle(arg.fh))
            }
            _ => None,
        }
    }
}

/// Open a file (`FUSE_OPEN`) or a directory (`FUSE_OPENDIR`)
#[derive(Debug)]
pub struct Open {
    arg: abi::fuse_open_in,
}
impl Open {
    pub fn flags(&self) -> i32 {
        self.arg.flags
    }
}

/// Read file data (`FUSE_READ`) or directory entries (`FUSE_READDIR`)
#[derive(Debug)]
pub struct Read {
    arg: abi::fuse_read_in,
}
impl Read {
    pub fn file_handle(&self) -> FileHandle {
        FileHandle(self.arg.fh)
    }
    pub fn offset(&self) -> i64 {
        self.arg.offset
    }
    pub fn size(&self) -> u32 {
        self.arg.size
    }
    pub fn flags(&self) -> i32 {
        self.arg.flags
    }
    pub fn lock_owner(&self) -> Option<LockOwner> {
        if self.arg.read_flags & consts::FUSE_READ_LOCKOWNER != 0 {
            Some(LockOwner(self.arg.lock_owner))
        } else {
            None
        }
    }
}

/// Release an open file (`FUSE_RELEASE`) or directory (`FUSE_RELEASEDIR`)
#[derive(Debug)]
pub struct Release {
    arg: abi::fuse_release_in,
}
impl Release {
    pub fn file_handle(&self) -> FileHandle {
        FileHandle(self.arg.fh)
    }
    pub fn flags(&self) -> i32 {
        self.arg.flags
    }
    pub fn flush(&self) -> bool {
        self.arg.release_flags & consts::FUSE_RELEASE_FLUSH != 0
    }
    pub fn lock_owner(&self) -> Option<LockOwner> {
        if self.flush() {
            Some(LockOwner(self.arg.lock_owner))
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct Flush {
    arg: abi::fuse_flush_in,
}
impl Flush {
    pub fn file_handle(&self) -> FileHandle {
        FileHandle(self.arg.fh)
    }
    pub fn lock_owner(&self) -> LockOwner {
        LockOwner(self.arg.lock_owner)
    }
}

#[derive(Debug)]
pub struct Access {
    arg: abi::fuse_access_in,
}
impl Access {
    pub fn mask(&self) -> i32 {
        self.arg.mask
    }
}

/// First message of every session: the kernel announces its protocol version and
/// capabilities
#[derive(Debug)]
pub struct Init {
    arg: abi::fuse_init_in,
}
impl Init {
    pub fn version(&self) -> Version {
        Version(self.arg.major, self.arg.minor)
    }
    pub fn capabilities(&self) -> u64 {
        u64::from(self.arg.flags)
    }
    pub fn max_readahead(&self) -> u32 {
        self.arg.max_readahead
    }
}

#[derive(Debug)]
pub struct Interrupt {
    arg: abi::fuse_interrupt_in,
}
impl Interrupt {
    pub fn unique(&self) -> RequestId {
        RequestId(self.arg.unique)
    }
}

/// Filesystem operation (and arguments) the kernel driver wants us to perform.
#[derive(Debug)]
pub enum Operation<'a> {
    Lookup(Lookup<'a>),
    Forget(Forget),
    GetAttr(GetAttr),
    Open(Open),
    Read(Read),
    StatFs,
    Release(Release),
    Flush(Flush),
    Init(Init),
    OpenDir(Open),
    ReadDir(Read),
    ReleaseDir(Release),
    Access(Access),
    Interrupt(Interrupt),
    Destroy,
    BatchForget(BatchForget),
    /// A valid opcode this filesystem never serves (writes, links, xattrs, ...)
    Unsupported(fuse_opcode),
}

impl Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup(x) => write!(f, "LOOKUP name {:?}", x.name()),
            Operation::Forget(x) => write!(f, "FORGET nlookup {}", x.nlookup()),
            Operation::GetAttr(_) => write!(f, "GETATTR"),
            Operation::Open(x) => write!(f, "OPEN flags {:#x}", x.flags()),
            Operation::Read(x) => write!(
                f,
                "READ fh {:?}, offset {}, size {}",
                x.file_handle(),
                x.offset(),
                x.size()
            ),
            Operation::StatFs => write!(f, "STATFS"),
            Operation::Release(x) => write!(
                f,
                "RELEASE fh {:?}, flags {:#x}, flush {}",
                x.file_handle(),
                x.flags(),
                x.flush()
            ),
            Operation::Flush(x) => write!(f, "FLUSH fh {:?}", x.file_handle()),
            Operation::Init(x) => write!(
                f,
                "INIT kernel ABI {}, capabilities {:#x}, max readahead {}",
                x.version(),
                x.capabilities(),
                x.max_readahead()
            ),
            Operation::OpenDir(x) => write!(f, "OPENDIR flags {:#x}", x.flags()),
            Operation::ReadDir(x) => write!(
                f,
                "READDIR fh {:?}, offset {}, size {}",
                x.file_handle(),
                x.offset(),
                x.size()
            ),
            Operation::ReleaseDir(x) => write!(
                f,
                "RELEASEDIR fh {:?}, flags {:#x}",
                x.file_handle(),
                x.flags()
            ),
            Operation::Access(x) => write!(f, "ACCESS mask {:#05o}", x.mask()),
            Operation::Interrupt(x) => write!(f, "INTERRUPT unique {:?}", x.unique()),
            Operation::Destroy => write!(f, "DESTROY"),
            Operation::BatchForget(x) => write!(f, "BATCH_FORGET nodes {}", x.nodes().len()),
            Operation::Unsupported(opcode) => write!(f, "{opcode:?}"),
        }
    }
}

/// A request as read from the kernel: the in header plus the raw argument bytes
#[derive(Debug)]
pub struct AnyRequest {
    header: abi::fuse_in_header,
    data: Vec<u8>,
}

impl AnyRequest {
    /// Returns the unique identifier of this request.
    pub fn unique(&self) -> RequestId {
        RequestId(self.header.unique)
    }
    /// Returns the node id of the inode this request is targeted to.
    pub fn nodeid(&self) -> INodeNo {
        INodeNo(self.header.nodeid)
    }
    /// Returns the UID that the process that triggered this request runs under.
    pub fn uid(&self) -> u32 {
        self.header.uid
    }
    /// Returns the GID that the process that triggered this request runs under.
    pub fn gid(&self) -> u32 {
        self.header.gid
    }
    /// Returns the PID of the process that triggered this request.
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    fn args(&self) -> &[u8] {
        &self.data[size_of::<abi::fuse_in_header>()..self.header.len as usize]
    }

    /// Decode the operation and its arguments.
    pub fn operation(&self) -> Result<Operation<'_>, RequestError> {
        let opcode = fuse_opcode::try_from(self.header.opcode)
            .map_err(|_| RequestError::UnknownOperation(self.header.opcode))?;
        let mut data = ArgumentIterator::new(self.args());
        Ok(match opcode {
            fuse_opcode::FUSE_LOOKUP => Operation::Lookup(Lookup {
                name: Path::new(data.fetch_str().ok_or(RequestError::InsufficientData)?),
            }),
            fuse_opcode::FUSE_FORGET => Operation::Forget(Forget {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_GETATTR => Operation::GetAttr(GetAttr { arg: data.fetch() }),
            fuse_opcode::FUSE_OPEN => Operation::Open(Open {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_READ => Operation::Read(Read {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_STATFS => Operation::StatFs,
            fuse_opcode::FUSE_RELEASE => Operation::Release(Release {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_FLUSH => Operation::Flush(Flush {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_INIT => Operation::Init(Init {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_OPENDIR => Operation::OpenDir(Open {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_READDIR => Operation::ReadDir(Read {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_RELEASEDIR => Operation::ReleaseDir(Release {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_ACCESS => Operation::Access(Access {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_INTERRUPT => Operation::Interrupt(Interrupt {
                arg: fetch(&mut data)?,
            }),
            fuse_opcode::FUSE_DESTROY => Operation::Destroy,
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg: abi::fuse_batch_forget_in = fetch(&mut data)?;
                let nodes = data
                    .fetch_vec(arg.count as usize)
                    .ok_or(RequestError::InsufficientData)?;
                Operation::BatchForget(BatchForget { nodes })
            }
            other => Operation::Unsupported(other),
        })
    }
}

fn fetch<T: FromBytes>(data: &mut ArgumentIterator<'_>) -> Result<T, RequestError> {
    data.fetch().ok_or(RequestError::InsufficientData)
}

impl Display for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation() {
            Ok(op) => write!(
                f,
                "FUSE({:3}) ino {:#018x} {}",
                self.header.unique, self.header.nodeid, op
            ),
            Err(_) => write!(
                f,
                "FUSE({:3}) ino {:#018x} opcode {}",
                self.header.unique, self.header.nodeid, self.header.opcode
            ),
        }
    }
}

impl TryFrom<Vec<u8>> for AnyRequest {
    type Error = RequestError;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        // Parse a raw packet as sent by the kernel driver into typed data. Every request always
        // begins with a `fuse_in_header` struct followed by arguments depending on the opcode.
        let (header, _) = abi::fuse_in_header::read_from_prefix(&data)
            .map_err(|_| RequestError::ShortReadHeader(data.len()))?;
        let len = header.len as usize;
        if len < size_of::<abi::fuse_in_header>() {
            return Err(RequestError::ShortReadHeader(len));
        }
        // Check data size
        if data.len() < len {
            return Err(RequestError::ShortRead(data.len(), len));
        }
        Ok(Self { header, data })
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn short_read_header() {
        match AnyRequest::try_from(vec![0u8; 20]) {
            Err(RequestError::ShortReadHeader(20)) => (),
            other => panic!("Unexpected request parsing result: {other:?}"),
        }
    }

    #[test]
    fn short_read() {
        let mut data = request_bytes(15, 0xdeadbeef, 2, &struct_bytes(&read_in(0, 5)));
        data.truncate(48);
        match AnyRequest::try_from(data) {
            Err(RequestError::ShortRead(48, 80)) => (),
            other => panic!("Unexpected request parsing result: {other:?}"),
        }
    }

    #[test]
    fn init() {
        let data = request_bytes(26, 0xdeadbeef, 0, &struct_bytes(&init_in(7, 8)));
        let req = AnyRequest::try_from(data).unwrap();
        assert_eq!(req.unique(), RequestId(0xdeadbeef));
        assert_eq!(req.uid(), 0xc001);
        assert_eq!(req.gid(), 0xc003);
        assert_eq!(req.pid(), 0xc0de);
        match req.operation().unwrap() {
            Operation::Init(x) => {
                assert_eq!(x.version(), Version(7, 8));
                assert_eq!(x.max_readahead(), 4096);
            }
            op => panic!("Unexpected request operation {op:?}"),
        }
    }

    #[test]
    fn lookup() {
        let data = request_bytes(1, 0xdeadbeef, 1, b"hello\0");
        let req = AnyRequest::try_from(data).unwrap();
        assert_eq!(req.nodeid(), INodeNo(1));
        match req.operation().unwrap() {
            Operation::Lookup(x) => assert_eq!(x.name(), Path::new("hello")),
            op => panic!("Unexpected request operation {op:?}"),
        }
    }

    #[test]
    fn lookup_without_terminator() {
        let data = request_bytes(1, 0xdeadbeef, 1, b"hello");
        let req = AnyRequest::try_from(data).unwrap();
        assert!(matches!(
            req.operation(),
            Err(RequestError::InsufficientData)
        ));
    }

    #[test]
    fn readdir() {
        let data = request_bytes(28, 0xdeadbeef, 1, &struct_bytes(&read_in(2, 4096)));
        let req = AnyRequest::try_from(data).unwrap();
        match req.operation().unwrap() {
            Operation::ReadDir(x) => {
                assert_eq!(x.offset(), 2);
                assert_eq!(x.size(), 4096);
                assert_eq!(x.lock_owner(), None);
            }
            op => panic!("Unexpected request operation {op:?}"),
        }
    }

    #[test]
    fn unsupported_and_unknown_opcodes() {
        let req = AnyRequest::try_from(request_bytes(16, 1, 2, &[])).unwrap();
        assert!(matches!(
            req.operation(),
            Ok(Operation::Unsupported(fuse_opcode::FUSE_WRITE))
        ));
        let req = AnyRequest::try_from(request_bytes(4242, 1, 2, &[])).unwrap();
        assert!(matches!(
            req.operation(),
            Err(RequestError::UnknownOperation(4242))
        ));
    }

    #[test]
    fn batch_forget() {
        let mut args = struct_bytes(&abi::fuse_batch_forget_in { count: 2, dummy: 0 });
        args.extend(struct_bytes(&abi::fuse_forget_one { nodeid: 2, nlookup: 3 }));
        args.extend(struct_bytes(&abi::fuse_forget_one { nodeid: 5, nlookup: 1 }));
        let req = AnyRequest::try_from(request_bytes(42, 1, 0, &args)).unwrap();
        match req.operation().unwrap() {
            Operation::BatchForget(x) => {
                assert_eq!(x.nodes().len(), 2);
                assert_eq!(x.nodes()[1].nodeid, 5);
            }
            op => panic!("Unexpected request operation {op:?}"),
        }
    }

    #[test]
    fn batch_forget_overstated_count() {
        let args = struct_bytes(&abi::fuse_batch_forget_in { count: u32::MAX, dummy: 0 });
        let req = AnyRequest::try_from(request_bytes(42, 1, 0, &args)).unwrap();
        assert!(matches!(
            req.operation(),
            Err(RequestError::InsufficientData)
        ));
    }

    #[test]
    fn display() {
        let data = request_bytes(3, 7, 1, &[0u8; 16]);
        let req = AnyRequest::try_from(data).unwrap();
        assert_eq!(
            req.to_string(),
            "FUSE(  7) ino 0x0000000000000001 GETATTR"
        );
    }
}
