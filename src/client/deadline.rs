//! Deadlines for in-flight exchanges.
//!
//! [`DeadlineQueue`] is a min-heap keyed by deadline, where every stored entry's slot is
//! tracked so that an entry can be removed from anywhere in the heap in `O(log n)`.
//! Most entries leave the queue through normal completion long before they reach the
//! root, so arbitrary removal is the common case, not the exception.
//!
//! All operations take a single lock for an `O(log n)` critical section; nothing blocks
//! while the lock is held.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::RequestRef;

/// Opaque handle to an entry in a [`DeadlineQueue`].
///
/// Handles are never reused, so removing through a stale handle can never disturb a
/// different entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u64);

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    key: u64,
    request: RequestRef,
}

impl Entry {
    fn before(&self, other: &Entry) -> bool {
        (self.deadline, self.key) < (other.deadline, other.key)
    }
}

#[derive(Debug, Default)]
struct Heap {
    entries: Vec<Entry>,

    /// Current slot in `entries` for every live key.
    slots: HashMap<u64, usize>,
    next: u64,
}

impl Heap {
    fn push(&mut self, request: RequestRef, deadline: Instant) -> EntryHandle {
        let key = self.next;
        self.next += 1;

        let slot = self.entries.len();
        self.entries.push(Entry {
            deadline,
            key,
            request,
        });
        self.slots.insert(key, slot);
        self.sift_up(slot);

        EntryHandle(key)
    }

    fn remove(&mut self, key: u64) -> Option<Entry> {
        let slot = *self.slots.get(&key)?;
        let last = self.entries.len() - 1;
        if slot != last {
            self.swap(slot, last);
        }

        let entry = self.entries.pop()?;
        self.slots.remove(&entry.key);
        if slot < self.entries.len() {
            self.sift_down(slot);
            self.sift_up(slot);
        }

        Some(entry)
    }

    fn pop_expired(&mut self, now: Instant) -> Option<Entry> {
        let key = match self.entries.first() {
            Some(root) if root.deadline <= now => root.key,
            _ => return None,
        };
        self.remove(key)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.slots.insert(self.entries[a].key, a);
        self.slots.insert(self.entries[b].key, b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.entries[slot].before(&self.entries[parent]) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;

            if left < len && self.entries[left].before(&self.entries[smallest]) {
                smallest = left;
            }
            if right < len && self.entries[right].before(&self.entries[smallest]) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }

            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

/// A concurrency-safe priority queue of exchange deadlines.
#[derive(Default)]
pub struct DeadlineQueue {
    heap: Mutex<Heap>,
}

impl fmt::Debug for DeadlineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl DeadlineQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(Heap {
                entries: Vec::with_capacity(capacity),
                slots: HashMap::with_capacity(capacity),
                next: 0,
            }),
        }
    }

    /// Register `request` to expire at `deadline`.
    pub fn insert(&self, request: RequestRef, deadline: Instant) -> EntryHandle {
        let id = request.id();
        let handle = self.heap.lock().push(request, deadline);
        trace!(request.id = id, ?handle, "deadline registered");
        handle
    }

    /// Remove an entry, returning its request if it was still registered.
    ///
    /// Removing an entry which was already removed or drained is a no-op.
    pub fn remove(&self, handle: EntryHandle) -> Option<RequestRef> {
        let entry = self.heap.lock().remove(handle.0)?;
        trace!(request.id = entry.request.id(), ?handle, "deadline removed");
        Some(entry.request)
    }

    /// Is the entry behind `handle` still registered?
    pub fn contains(&self, handle: EntryHandle) -> bool {
        self.heap.lock().slots.contains_key(&handle.0)
    }

    /// Remove and yield every entry whose deadline is at or before `now`, earliest first.
    ///
    /// The iterator takes the lock once per yielded entry, and yields at most as many
    /// entries as the queue held when it was created. Drop it early to stop draining;
    /// call again to resume.
    pub fn drain_expired(&self, now: Instant) -> DrainExpired<'_> {
        DrainExpired {
            queue: self,
            now,
            remaining: self.len(),
        }
    }

    /// The earliest registered deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().entries.first().map(|entry| entry.deadline)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    /// Are there no registered entries?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over expired entries, created by [`DeadlineQueue::drain_expired`].
#[derive(Debug)]
pub struct DrainExpired<'q> {
    queue: &'q DeadlineQueue,
    now: Instant,
    remaining: usize,
}

impl Iterator for DrainExpired<'_> {
    type Item = RequestRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let entry = self.queue.heap.lock().pop_expired(self.now)?;
        self.remaining -= 1;
        Some(entry.request)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
