//! A bounded ring-buffer queue.
//!
//! Backs the raft log: entries are appended at the tail, random-accessed by
//! position and truncated from the back when a follower has to discard an
//! uncommitted suffix. The capacity is fixed at construction; a full ring
//! rejects pushes instead of growing.

/// Fixed-capacity FIFO with O(1) random access.
///
/// `head` and `tail` are monotonically increasing logical positions; the
/// slot for position `p` is `p & mask`. `capacity` is rounded up to the
/// next power of two so the mask trick works.
pub struct RingQueue<T> {
    data: Vec<Option<T>>,
    mask: usize,
    head: usize,
    tail: usize,
}

impl<T> RingQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let mut data = Vec::with_capacity(cap);
        data.resize_with(cap, || None);
        RingQueue {
            data,
            mask: cap - 1,
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Appends an element at the tail. Returns false (and leaves the ring
    /// untouched) when the ring is full.
    pub fn push_back(&mut self, value: T) -> bool {
        if self.len() == self.capacity() {
            return false;
        }
        self.data[self.head & self.mask] = Some(value);
        self.head += 1;
        true
    }

    /// Removes up to `count` elements from the back. Returns the number
    /// actually removed.
    pub fn truncate_back(&mut self, count: usize) -> usize {
        let count = count.min(self.len());
        for _ in 0..count {
            self.head -= 1;
            self.data[self.head & self.mask] = None;
        }
        count
    }

    /// The element at offset `index` from the front (0 is the oldest).
    pub fn at(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        self.data[(self.tail + index) & self.mask].as_ref()
    }
}
