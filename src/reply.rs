//! Filesystem operation reply
//!
//! A reply handler is created for every request and must be used to send back the result of
//! the operation. Every sending method consumes the handler, so a request is answered at most
//! once; a handler dropped without sending answers with `EIO`, so it is answered at least
//! once too.

use crate::data::{Attr, DirEntry, Entry, Open, Statfs};
use crate::ll::{self, fuse_abi as abi, DirEntList, DirEntOffset, Errno, INodeNo};
use log::{debug, error, warn};
use std::fmt;
use std::io::IoSlice;

/// Generic reply callback to send data
pub trait ReplySender: Send + Sync + Unpin + 'static {
    /// Send data.
    fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()>;
}

impl fmt::Debug for Box<dyn ReplySender> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Box<ReplySender>")
    }
}

/// Sends the one reply a request is owed
#[derive(Debug)]
pub(crate) struct ReplyHandler {
    /// Unique id of the request to reply to
    unique: ll::RequestId,
    /// Closure to call for sending the reply
    sender: Option<Box<dyn ReplySender>>,
}

impl ReplyHandler {
    pub(crate) fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyHandler {
        let sender = Box::new(sender);
        ReplyHandler {
            unique: ll::RequestId(unique),
            sender: Some(sender),
        }
    }

    /// Reply to a request with the given error code and data. Only the first call on a
    /// handler sends anything (the public methods ensure this by consuming `self`)
    fn send_ll_mut(&mut self, response: &ll::Response<'_>) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let res = response.with_iovec(self.unique, |iov| sender.send(iov));
        if let Err(err) = res {
            error!("Failed to send FUSE reply: {}", err);
        }
    }
    fn send_ll(mut self, response: &ll::Response<'_>) {
        self.send_ll_mut(response)
    }

    /// Reply to a request with the given error code
    pub(crate) fn error(self, err: Errno) {
        self.send_ll(&ll::Response::new_error(err));
    }

    /// Reply to a request with nothing
    pub(crate) fn ok(self) {
        self.send_ll(&ll::Response::new_empty());
    }

    /// Reply to a request with the given data
    pub(crate) fn data(self, data: &[u8]) {
        self.send_ll(&ll::Response::new_slice(data));
    }

    /// Reply to a request with the given entry
    pub(crate) fn entry(self, entry: Entry) {
        self.send_ll(&ll::Response::new_entry(
            INodeNo(entry.attr.ino),
            ll::Generation(entry.generation),
            &entry.attr.into(),
            entry.ttl,
            entry.ttl,
        ));
    }

    /// Reply to a request with the given attribute
    pub(crate) fn attr(self, attr: Attr) {
        self.send_ll(&ll::Response::new_attr(&attr.ttl, &attr.attr.into()));
    }

    /// Reply to a request with the given open result
    pub(crate) fn opened(self, open: Open) {
        self.send_ll(&ll::Response::new_open(ll::FileHandle(open.fh), open.flags));
    }

    /// Reply to a request with filesystem statistics
    pub(crate) fn statfs(self, statfs: Statfs) {
        self.send_ll(&ll::Response::new_statfs(
            statfs.blocks,
            statfs.bfree,
            statfs.bavail,
            statfs.files,
            statfs.ffree,
            statfs.bsize,
            statfs.namelen,
            statfs.frsize,
        ));
    }

    /// Reply to INIT with the negotiated connection parameters
    pub(crate) fn config(self, out: &abi::fuse_init_out) {
        self.send_ll(&ll::Response::new_init(out));
    }

    /// Reply to a request with as many directory entries as fit in `max_size` bytes.
    ///
    /// Packing stops at the first entry that does not fit, so the kernel resumes from its
    /// predecessor's cursor. An empty reply tells the kernel the listing is complete.
    pub(crate) fn dir(self, entries: &[DirEntry], max_size: usize) {
        let mut buf = DirEntList::new(max_size);
        let mut packed = 0;
        for item in entries {
            let full = buf.push(&ll::DirEntry::new(
                INodeNo(item.ino),
                DirEntOffset(item.offset),
                item.kind,
                &item.name,
            ));
            if full {
                break;
            }
            packed += 1;
        }
        debug!(
            "Packed {} of {} directory entries into {}/{} bytes",
            packed,
            entries.len(),
            buf.len(),
            max_size
        );
        self.send_ll(&buf.into());
    }

    /// Consume the handler without replying. Only for operations the kernel never expects an
    /// answer to (FORGET, BATCH_FORGET).
    pub(crate) fn disable(mut self) {
        self.sender = None;
    }
}

impl Drop for ReplyHandler {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!(
                "Reply not sent for operation {}, replying with I/O error",
                self.unique.0
            );
            self.send_ll_mut(&ll::Response::new_error(Errno::EIO));
        }
    }
}

/// Reply senders that record what they are given
#[cfg(test)]
pub(crate) mod test_util {
    use super::ReplySender;
    use std::io::IoSlice;
    use std::sync::{Arc, Mutex};

    /// Collects every reply sent through it. Clones share the same record.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CaptureSender {
        replies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl CaptureSender {
        pub(crate) fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.replies.lock().unwrap())
        }
    }

    impl ReplySender for CaptureSender {
        fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()> {
            let mut v = vec![];
            for x in data {
                v.extend_from_slice(x)
            }
            self.replies.lock().unwrap().push(v);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_util::CaptureSender;
    use super::*;
    use crate::data::{FileAttr, FileType};
    use std::sync::mpsc::{sync_channel, SyncSender};
    use std::thread;
    use std::time::{Duration, UNIX_EPOCH};

    struct AssertSender {
        expected: Vec<u8>,
    }

    impl super::ReplySender for AssertSender {
        fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()> {
            let mut v = vec![];
            for x in data {
                v.extend_from_slice(x)
            }
            assert_eq!(self.expected, v);
            Ok(())
        }
    }

    fn file_attr() -> FileAttr {
        let time = UNIX_EPOCH + Duration::new(0x1234, 0x5678);
        FileAttr {
            ino: 0x11,
            size: 0x22,
            blocks: 0x33,
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 0x55,
            uid: 0x66,
            gid: 0x77,
            rdev: 0x88,
            flags: 0x99,
            blksize: 0xbb,
        }
    }

    #[test]
    fn reply_error() {
        let sender = AssertSender {
            expected: vec![
                0x10, 0x00, 0x00, 0x00, 0xfe, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00,
            ],
        };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.error(Errno::ENOENT);
    }

    #[test]
    fn reply_empty() {
        let sender = AssertSender {
            expected: vec![
                0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00,
            ],
        };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.ok();
    }

    #[test]
    fn reply_data() {
        let sender = AssertSender {
            expected: vec![
                0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            ],
        };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.data(&[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn reply_entry() {
        let mut expected = vec![
            0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
            0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xaa, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x65, 0x87, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x65, 0x87,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x21, 0x43, 0x00, 0x00, 0x21, 0x43, 0x00, 0x00,
            0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x34, 0x12,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x56, 0x00, 0x00, 0x78, 0x56, 0x00, 0x00,
            0x78, 0x56, 0x00, 0x00, 0xa4, 0x81, 0x00, 0x00, 0x55, 0x00, 0x00, 0x00, 0x66, 0x00,
            0x00, 0x00, 0x77, 0x00, 0x00, 0x00, 0x88, 0x00, 0x00, 0x00, 0xbb, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];
        expected[0] = expected.len() as u8;

        let sender = AssertSender { expected };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.entry(Entry {
            attr: file_attr(),
            ttl: Duration::new(0x8765, 0x4321),
            generation: 0xaa,
        });
    }

    #[test]
    fn reply_attr() {
        let mut expected = vec![
            0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
            0x00, 0x00, 0x65, 0x87, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x21, 0x43, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x34, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x56, 0x00, 0x00,
            0x78, 0x56, 0x00, 0x00, 0x78, 0x56, 0x00, 0x00, 0xa4, 0x81, 0x00, 0x00, 0x55, 0x00,
            0x00, 0x00, 0x66, 0x00, 0x00, 0x00, 0x77, 0x00, 0x00, 0x00, 0x88, 0x00, 0x00, 0x00,
            0xbb, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        expected[0] = expected.len() as u8;

        let sender = AssertSender { expected };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.attr(Attr {
            attr: file_attr(),
            ttl: Duration::new(0x8765, 0x4321),
        });
    }

    #[test]
    fn reply_open() {
        let sender = AssertSender {
            expected: vec![
                0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00, 0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00,
            ],
        };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.opened(Open {
            fh: 0x1122,
            flags: 0x33,
        });
    }

    #[test]
    fn reply_directory() {
        let sender = AssertSender {
            expected: vec![
                0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00, 0xbb, 0xaa, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x68, 0x65,
                0x6c, 0x6c, 0x6f, 0x00, 0x00, 0x00, 0xdd, 0xcc, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x08, 0x00,
                0x00, 0x00, 0x77, 0x6f, 0x72, 0x6c, 0x64, 0x2e, 0x72, 0x73,
            ],
        };
        let reply = ReplyHandler::new(0xdeadbeef, sender);
        reply.dir(
            &[
                DirEntry {
                    ino: 0xaabb,
                    offset: 1,
                    kind: FileType::Directory,
                    name: "hello".into(),
                },
                DirEntry {
                    ino: 0xccdd,
                    offset: 2,
                    kind: FileType::RegularFile,
                    name: "world.rs".into(),
                },
            ],
            4096,
        );
    }

    #[test]
    fn reply_directory_stops_at_first_overflow() {
        let sender = CaptureSender::default();
        let reply = ReplyHandler::new(1, sender.clone());
        let entries: Vec<DirEntry> = ["a", "bb", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| DirEntry {
                ino: 10 + i as u64,
                offset: i as i64 + 1,
                kind: FileType::RegularFile,
                name: name.into(),
            })
            .collect();
        // Room for two 32-byte records
        reply.dir(&entries, 70);
        let replies = sender.take();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].len(), 16 + 64);
        // Second record carries cursor 2, so the kernel resumes with "c"
        assert_eq!(replies[0][16 + 32 + 8], 2);
    }

    #[test]
    fn dropped_handler_replies_eio() {
        let sender = CaptureSender::default();
        drop(ReplyHandler::new(0xdeadbeef, sender.clone()));
        let replies = sender.take();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            vec![
                0x10, 0x00, 0x00, 0x00, 0xfb, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00,
            ]
        );
    }

    #[test]
    fn disabled_handler_stays_silent() {
        let sender = CaptureSender::default();
        ReplyHandler::new(7, sender.clone()).disable();
        assert!(sender.take().is_empty());
    }

    impl super::ReplySender for SyncSender<()> {
        fn send(&self, _: &[IoSlice<'_>]) -> std::io::Result<()> {
            self.send(()).unwrap();
            Ok(())
        }
    }

    #[test]
    fn async_reply() {
        let (tx, rx) = sync_channel::<()>(1);
        let reply = ReplyHandler::new(0xdeadbeef, tx);
        thread::spawn(move || {
            reply.ok();
        });
        rx.recv().unwrap();
    }
}
