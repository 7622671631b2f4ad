//! Resizable byte buffer carrying a logical length and a last-mutation
//! timestamp, plus scoped writer/reader guards over it.

use crate::codec::{Reader, Writer};
use std::time::{SystemTime, UNIX_EPOCH};

/// A byte buffer with a logical length that may be smaller than its
/// allocated capacity, and a timestamp of the last time it was mutated.
///
/// `resize` does not preserve content across a growth: callers that need
/// the previous bytes must copy them out first. This mirrors the wire
/// message object of the protocol, which is always fully rewritten by a
/// `Writer` rather than patched in place.
pub struct Message {
    data: Vec<u8>,
    length: usize,
    last_modified: SystemTime,
}

impl Message {
    #[inline]
    pub fn new() -> Message {
        Message {
            data: Vec::new(),
            length: 0,
            last_modified: SystemTime::now(),
        }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Message {
        Message {
            data: Vec::with_capacity(capacity),
            length: 0,
            last_modified: SystemTime::now(),
        }
    }

    /// Logical length of the message, always `<= capacity()`.
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Milliseconds since the Unix epoch when this message was last
    /// touched, for callers that want a plain number rather than a
    /// `SystemTime`.
    pub fn last_modified_millis(&self) -> u64 {
        self.last_modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Sets the logical length to `n`, growing capacity if needed. Growth
    /// does not preserve existing content; new bytes are zero-filled.
    pub fn resize(&mut self, n: usize) {
        self.data.clear();
        self.data.resize(n, 0);
        self.length = n;
        self.touch();
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    #[inline]
    fn touch(&mut self) {
        self.last_modified = SystemTime::now();
    }

    /// Opens a write scope. On drop the message's bytes are replaced with
    /// whatever the scope wrote, and the modification timestamp advances.
    /// Only one writer or reader scope may be open on a `Message` at a
    /// time; the borrow checker enforces this since `writer()` takes
    /// `&mut self`.
    #[inline]
    pub fn writer(&mut self) -> MessageWriter<'_> {
        MessageWriter {
            message: self,
            staging: Vec::new(),
        }
    }

    /// Opens a read scope over the current contents.
    #[inline]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(self.as_slice())
    }
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

/// Write scope over a [`Message`]. Bytes accumulate in a private staging
/// buffer and are committed back to the message on drop, so a writer that
/// is abandoned mid-fill (e.g. by an early `?` return) never leaves the
/// message in a half-written state.
pub struct MessageWriter<'a> {
    message: &'a mut Message,
    staging: Vec<u8>,
}

impl<'a> MessageWriter<'a> {
    #[inline]
    pub fn cursor(&mut self) -> Writer<'_> {
        Writer::new(&mut self.staging)
    }

    /// Commits the staged bytes early and returns a fresh, empty scope
    /// bound to the same message.
    pub fn commit(self) {
        // Drop glue below performs the commit.
    }
}

impl<'a> Drop for MessageWriter<'a> {
    fn drop(&mut self) {
        let staging = std::mem::take(&mut self.staging);
        let len = staging.len();
        self.message.data = staging;
        self.message.length = len;
        self.message.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_grows_and_does_not_preserve_content() {
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            w.cursor().write_byte(0xAB);
        }
        assert_eq!(msg.as_slice(), &[0xAB]);

        msg.resize(4);
        assert_eq!(msg.len(), 4);
        assert_eq!(msg.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn writer_scope_commits_on_drop() {
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_ushort(7);
            cursor.write_byte(9);
        }
        assert_eq!(msg.len(), 3);
        let mut reader = msg.reader();
        assert_eq!(reader.read_ushort().unwrap(), 7);
        assert_eq!(reader.read_byte().unwrap(), 9);
    }

    #[test]
    fn touch_advances_timestamp() {
        let mut msg = Message::new();
        let first = msg.last_modified();
        std::thread::sleep(std::time::Duration::from_millis(5));
        msg.resize(1);
        assert!(msg.last_modified() >= first);
    }

    #[test]
    fn reader_sees_only_logical_length() {
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            w.cursor().write_bytes(&[1, 2, 3]);
        }
        let mut r = msg.reader();
        assert_eq!(r.remaining(), 3);
    }
}
