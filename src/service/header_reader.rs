//! Incremental detection of the request header boundary.

use bytes::{Bytes, BytesMut};

/// The blank line that terminates a request header.
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Accumulates request bytes across reads until the header terminator shows up.
///
/// The scan for the terminator always restarts a few bytes before the newly
/// appended chunk, so a `\r\n\r\n` split over two (or more) reads is still
/// found.
///
/// # Examples
///
/// ```
/// use slib_http::service::HeaderReader;
///
/// let mut reader = HeaderReader::new();
/// assert_eq!(reader.add(b"GET / HTTP/1.1\r\nHost: h\r\n"), None);
/// assert_eq!(reader.add(b"\r\nbody"), Some(2));
/// assert_eq!(&reader.take_header()[..], b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
/// ```
#[derive(Debug, Default)]
pub struct HeaderReader {
    buf: BytesMut,
}

impl HeaderReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and looks for the header terminator.
    ///
    /// Returns the offset of the first body byte *within `chunk`* once the
    /// terminator is found. From then on the reader holds exactly the header
    /// bytes (terminator included); trailing bytes of `chunk` are not kept.
    pub fn add(&mut self, chunk: &[u8]) -> Option<usize> {
        let previous = self.buf.len();
        let scan_from = previous.saturating_sub(HEADER_TERMINATOR.len() - 1);
        self.buf.extend_from_slice(chunk);

        let found = self.buf[scan_from..]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)?;
        let header_end = scan_from + found + HEADER_TERMINATOR.len();
        self.buf.truncate(header_end);
        // A terminator lying entirely inside earlier chunks would have been
        // reported by an earlier call, so header_end > previous here.
        Some(header_end - previous)
    }

    /// Number of header bytes accumulated so far.
    pub fn header_size(&self) -> usize {
        self.buf.len()
    }

    /// Takes the accumulated bytes, leaving the reader empty.
    pub fn take_header(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
