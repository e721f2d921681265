//! Fixed-capacity circular byte buffer for terminal scrollback.
//!
//! A [`CircularByteBuffer`] keeps the most recent `capacity` bytes written to
//! it. Writes are O(len) with at most two `copy_from_slice` segments; when
//! the buffer is full the oldest bytes are discarded. A snapshot copies the
//! retained bytes in logical (oldest-first) order, which is what a freshly
//! attaching viewer replays.

/// Ring buffer over raw bytes with overwrite-oldest semantics.
pub struct CircularByteBuffer {
    buf: Vec<u8>,
    /// Index of the next write.
    head: usize,
    /// Index of the oldest retained byte.
    tail: usize,
    /// Number of retained bytes, `0..=capacity`.
    count: usize,
}

impl CircularByteBuffer {
    /// Create a buffer that retains at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            buf: vec![0u8; capacity],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Append `data`, discarding the oldest bytes on overflow.
    ///
    /// A write at least as large as the capacity resets the buffer to the
    /// trailing `capacity` bytes of `data`.
    pub fn write(&mut self, data: &[u8]) {
        let cap = self.buf.len();

        if data.len() >= cap {
            let start = data.len() - cap;
            self.buf.copy_from_slice(&data[start..]);
            self.head = 0;
            self.tail = 0;
            self.count = cap;
            return;
        }

        // Evict just enough of the oldest bytes to fit.
        let overflow = (self.count + data.len()).saturating_sub(cap);
        if overflow > 0 {
            self.tail = (self.tail + overflow) % cap;
            self.count -= overflow;
        }

        // Write in up to two segments, wrapping at the end of the storage.
        let first = data.len().min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.head = (self.head + data.len()) % cap;
        self.count += data.len();
    }

    /// Copy the retained bytes in logical order.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.buf.len();
        let mut out = Vec::with_capacity(self.count);
        let first = self.count.min(cap - self.tail);
        out.extend_from_slice(&self.buf[self.tail..self.tail + first]);
        if first < self.count {
            out.extend_from_slice(&self.buf[..self.count - first]);
        }
        out
    }

    /// Discard all retained bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Maximum number of retained bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}
