//! FIFO of pending dispatch requests.
//!
//! A deque of fixed-size ring chunks: push and shift are O(1) amortized and a
//! drained chunk is kept as a spare instead of being freed, so a pool that
//! oscillates around a chunk boundary does not allocate.
//!
//! A request refused during drain replay is put back with `unshift`, so it
//! keeps its place ahead of later arrivals.
//!
//! Removal from the middle (a queued request aborted by its caller) leaves a
//! tombstone that `shift` skips.

use std::collections::VecDeque;

/// Slots per ring chunk. Must be a power of two.
pub const CHUNK_SIZE: usize = 2048;
const CHUNK_MASK: usize = CHUNK_SIZE - 1;

struct Chunk<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        Self {
            slots: (0..CHUNK_SIZE).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// One slot stays unused to tell full from empty.
    fn is_full(&self) -> bool {
        (self.tail + 1) & CHUNK_MASK == self.head
    }

    fn push(&mut self, item: T) {
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) & CHUNK_MASK;
    }

    fn unshift(&mut self, item: T) {
        self.head = (self.head + CHUNK_MASK) & CHUNK_MASK;
        self.slots[self.head] = Some(item);
    }

    /// Pops the head slot, which may be a tombstone.
    fn shift(&mut self) -> Option<Option<T>> {
        if self.is_empty() {
            return None;
        }
        let slot = self.slots[self.head].take();
        self.head = (self.head + 1) & CHUNK_MASK;
        Some(slot)
    }

    fn reset(&mut self) {
        while self.shift().is_some() {}
        self.head = 0;
        self.tail = 0;
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Option<T>> + '_ {
        let (head, tail) = (self.head, self.tail);
        let count = tail.wrapping_sub(head) & CHUNK_MASK;
        let slots = &mut self.slots;
        let (front, back) = slots.split_at_mut(head);
        back.iter_mut().chain(front.iter_mut()).take(count)
    }
}

/// Chunked FIFO queue.
pub struct Queue<T> {
    chunks: VecDeque<Chunk<T>>,
    spare: Option<Chunk<T>>,
    len: usize,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let mut chunks = VecDeque::with_capacity(1);
        chunks.push_back(Chunk::new());
        Self {
            chunks,
            spare: None,
            len: 0,
        }
    }

    /// Number of live (non-tombstoned) items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, item: T) {
        let needs_chunk = self.chunks.back().map_or(true, Chunk::is_full);
        if needs_chunk {
            let chunk = self.spare.take().unwrap_or_else(Chunk::new);
            self.chunks.push_back(chunk);
        }
        if let Some(chunk) = self.chunks.back_mut() {
            chunk.push(item);
            self.len += 1;
        }
    }

    /// Put an item back in front of every other item.
    pub fn unshift(&mut self, item: T) {
        let needs_chunk = self.chunks.front().map_or(true, Chunk::is_full);
        if needs_chunk {
            let chunk = self.spare.take().unwrap_or_else(Chunk::new);
            self.chunks.push_front(chunk);
        }
        if let Some(chunk) = self.chunks.front_mut() {
            chunk.unshift(item);
            self.len += 1;
        }
    }

    pub fn shift(&mut self) -> Option<T> {
        while self.len > 0 {
            let front = self.chunks.front_mut()?;
            match front.shift() {
                Some(Some(item)) => {
                    self.len -= 1;
                    self.recycle_front();
                    return Some(item);
                }
                // tombstone
                Some(None) => self.recycle_front(),
                None => {
                    if self.chunks.len() == 1 {
                        return None;
                    }
                    self.recycle_front();
                }
            }
        }
        None
    }

    /// Tombstone the first item matching `pred` and return it.
    pub fn remove_first<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let removed = self
            .chunks
            .iter_mut()
            .flat_map(|chunk| chunk.iter_mut())
            .find(|slot| slot.as_ref().is_some_and(&mut pred))
            .and_then(Option::take);

        if removed.is_some() {
            self.len -= 1;
            if self.len == 0 {
                self.clear_tombstones();
            }
        }
        removed
    }

    /// Remove every item in FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        while let Some(item) = self.shift() {
            items.push(item);
        }
        self.clear_tombstones();
        items
    }

    fn recycle_front(&mut self) {
        let drained = self.chunks.len() > 1 && self.chunks.front().is_some_and(Chunk::is_empty);
        if drained {
            if let Some(mut chunk) = self.chunks.pop_front() {
                chunk.reset();
                self.spare = Some(chunk);
            }
        }
    }

    fn clear_tombstones(&mut self) {
        while self.chunks.len() > 1 {
            if let Some(mut chunk) = self.chunks.pop_back() {
                chunk.reset();
                self.spare = Some(chunk);
            }
        }
        if let Some(chunk) = self.chunks.front_mut() {
            chunk.reset();
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
