use std::{
    fs::File,
    io::{self, IoSlice},
    os::fd::{AsFd, AsRawFd, BorrowedFd},
    sync::Arc,
};

use crate::ll::fuse_abi;
use crate::reply::ReplySender;
use libc::{c_int, c_void, size_t};

pub const FUSE_HEADER_ALIGNMENT: usize = std::mem::align_of::<fuse_abi::fuse_in_header>();

pub(crate) fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment {
        buf
    } else {
        &mut buf[off..]
    }
}

/// A raw communication channel to the FUSE kernel driver.
/// May be cloned and sent to other threads.
#[derive(Clone, Debug)]
pub(crate) struct Channel {
    device: Arc<File>,
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

impl Channel {
    /// Create a new communication channel to the kernel driver.
    /// The argument is a `File` opened on a fuse device.
    pub fn new(device: File) -> Self {
        Self {
            device: Arc::new(device),
        }
    }

    /// Receives one request, up to the capacity of the given buffer (can block).
    /// The kernel needs the buffer aligned for `fuse_in_header`, so data lands at the first
    /// aligned position.
    pub fn receive(&self, buffer: &mut [u8]) -> io::Result<Vec<u8>> {
        let buf_aligned = aligned_sub_buf(buffer, FUSE_HEADER_ALIGNMENT);
        let rc = unsafe {
            libc::read(
                self.device.as_raw_fd(),
                buf_aligned.as_mut_ptr() as *mut c_void,
                buf_aligned.len() as size_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Vec::from(&buf_aligned[..rc as usize]))
        }
    }

    /// Writes one reply with a single `writev`, so the kernel sees it atomically.
    /// Blocks the current thread.
    pub fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let rc = unsafe {
            libc::writev(
                self.device.as_raw_fd(),
                bufs.as_ptr().cast::<libc::iovec>(),
                bufs.len() as c_int,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            debug_assert_eq!(bufs.iter().map(|b| b.len()).sum::<usize>(), rc as usize);
            Ok(())
        }
    }
}

impl ReplySender for Channel {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        Channel::send(self, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Channel, Channel) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Channel::new(File::from(OwnedFd::from(a))),
            Channel::new(File::from(OwnedFd::from(b))),
        )
    }

    #[test]
    fn alignment() {
        let mut buf = vec![0u8; 64];
        let aligned = aligned_sub_buf(&mut buf, FUSE_HEADER_ALIGNMENT);
        assert_eq!(aligned.as_ptr() as usize % FUSE_HEADER_ALIGNMENT, 0);
        assert!(aligned.len() > 64 - FUSE_HEADER_ALIGNMENT);
    }

    #[test]
    fn send_gathers_slices() {
        let (tx, rx) = pair();
        tx.send(&[IoSlice::new(b"Hello, "), IoSlice::new(b"World!\n")])
            .unwrap();
        let mut buf = vec![0u8; 128];
        assert_eq!(rx.receive(&mut buf).unwrap(), b"Hello, World!\n");
    }

    #[test]
    fn replies_go_through_the_channel() {
        let (tx, rx) = pair();
        let sender: Box<dyn ReplySender> = Box::new(tx.clone());
        sender.send(&[IoSlice::new(&[1, 2, 3])]).unwrap();
        let mut buf = vec![0u8; 16];
        assert_eq!(rx.receive(&mut buf).unwrap(), vec![1, 2, 3]);
    }
}
