//! Argument decomposition for FUSE operation requests.
//!
//! Helper to decompose a slice of binary data (incoming FUSE request) into multiple data
//! structures (request arguments).

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use zerocopy::FromBytes;

/// An iterator that can be used to fetch typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data left. The value is
    /// copied out, so the request buffer needs no particular alignment.
    pub fn fetch<T: FromBytes>(&mut self) -> Option<T> {
        match T::read_from_prefix(self.data) {
            Ok((x, rest)) => {
                self.data = rest;
                Some(x)
            }
            Err(_) => {
                if !self.data.is_empty() {
                    // Only warn if there is some data left
                    log::warn!(
                        "Data too short to fetch {}: {} bytes left",
                        std::any::type_name::<T>(),
                        self.data.len()
                    );
                }
                None
            }
        }
    }

    /// Fetch a slice of typed arguments. Returns `None` if there's not enough data left.
    pub fn fetch_vec<T: FromBytes>(&mut self, count: usize) -> Option<Vec<T>> {
        if count.checked_mul(std::mem::size_of::<T>())? > self.data.len() {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.fetch::<T>()?);
        }
        Some(out)
    }

    /// Fetch a (zero-terminated) string (can be non-utf8). Returns `None` if there's not
    /// enough data left or no zero-termination could be found.
    pub fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(out))
    }
}
