//! Per-connection line accumulator.
//!
//! Each connection owns exactly one `LineBuffer`. The event loop fills it
//! with one non-blocking read per readiness event; bytes accumulate across
//! events until a complete newline-terminated line is available.

use bytes::BytesMut;
use std::io::{self, Read};

/// Fixed-capacity byte accumulator with line extraction.
///
/// Capacity bounds the longest accepted line. A connection whose peer sends
/// `capacity` bytes without a newline is a protocol violation and gets closed
/// by the caller.
pub struct LineBuffer {
    data: BytesMut,
    capacity: usize,
}

impl LineBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no spare capacity remains for another read.
    ///
    /// A full buffer with no newline can never complete a line; the caller
    /// must treat the connection as broken rather than wait for another
    /// readiness event that may never come.
    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    /// Perform exactly one read from `src` into the spare capacity.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end-of-stream.
    /// Fails with `InvalidData` if the buffer is already full, since no
    /// newline can ever arrive within the accepted line length.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let len = self.data.len();
        let spare = self.capacity - len;
        if spare == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds buffer capacity",
            ));
        }

        self.data.resize(len + spare, 0);
        match src.read(&mut self.data[len..]) {
            Ok(n) => {
                self.data.truncate(len + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(len);
                Err(e)
            }
        }
    }

    /// Extract the first complete line, if one is buffered.
    ///
    /// The terminator (`\n`, optionally preceded by `\r`) and surrounding
    /// ASCII whitespace are trimmed. Bytes after the newline stay buffered.
    pub fn take_line(&mut self) -> Option<String> {
        let pos = self.data.iter().position(|&b| b == b'\n')?;
        let line = self.data.split_to(pos + 1);
        Some(String::from_utf8_lossy(&line[..pos]).trim().to_string())
    }
}
