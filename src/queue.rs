//! The receive-queue plumbing: a bounded lock-free ring of node pointers, an
//! unbounded chain of such rings, and the awaitable facade the receive
//! window pops from.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{INITIAL_RING_CAPACITY, MAXIMUM_RING_CAPACITY};
use crate::pool::WindowBuf;
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::time::Instant;

/// One queued segment: a pooled payload region, the meaningful length, and
/// whether the producer split a larger logical write after this piece.
#[derive(Debug, Default)]
pub(crate) struct ListElement {
    pub(crate) buf: Option<WindowBuf>,
    pub(crate) len: u16,
    pub(crate) part: bool,
}

impl ListElement {
    /// Clear all fields so the node can go back to its pool.
    pub(crate) fn reset(&mut self) {
        self.buf = None;
        self.len = 0;
        self.part = false;
    }
}

/// Head and tail indices packed into one atomic word: head in the low half,
/// tail in the high half. Both wrap freely; the difference is what counts.
const fn pack_indices(head: u32, tail: u32) -> u64 {
    ((tail as u64) << 32) | head as u64
}

const fn unpack_indices(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// A bounded MPMC ring of node pointers. Capacity must be a power of two so
/// slot indexing is a mask.
///
/// Publication protocol: a producer first CASes the packed word to reserve
/// the head slot, then stores the pointer into it; a consumer CASes the tail
/// forward and then takes the pointer, spinning for the brief window in
/// which the producer has reserved but not yet published.
pub(crate) struct BufDequeue {
    head_tail: AtomicU64,
    vals: Box<[AtomicPtr<ListElement>]>,
    /// The next, larger ring once this one has filled. Set once.
    next: AtomicPtr<BufDequeue>,
}

impl BufDequeue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            head_tail: AtomicU64::new(0),
            vals: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.vals.len()
    }

    fn mask(&self) -> u32 {
        self.vals.len() as u32 - 1
    }

    /// Append a node. Fails when the ring is full.
    pub(crate) fn push_head(&self, val: *mut ListElement) -> bool {
        debug_assert!(!val.is_null());
        loop {
            let word = self.head_tail.load(Ordering::Acquire);
            let (head, tail) = unpack_indices(word);
            if head.wrapping_sub(tail) == self.vals.len() as u32 {
                return false;
            }
            let reserved = pack_indices(head.wrapping_add(1), tail);
            if self
                .head_tail
                .compare_exchange_weak(word, reserved, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // The slot is ours; publish for the consumer side.
                self.vals[(head & self.mask()) as usize].store(val, Ordering::Release);
                return true;
            }
        }
    }

    /// Take the oldest node. Fails when the ring is empty.
    pub(crate) fn pop_tail(&self) -> Option<*mut ListElement> {
        loop {
            let word = self.head_tail.load(Ordering::Acquire);
            let (head, tail) = unpack_indices(word);
            if head == tail {
                return None;
            }
            let advanced = pack_indices(head, tail.wrapping_add(1));
            if self
                .head_tail
                .compare_exchange_weak(word, advanced, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.vals[(tail & self.mask()) as usize];
                loop {
                    let val = slot.swap(ptr::null_mut(), Ordering::AcqRel);
                    if !val.is_null() {
                        return Some(val);
                    }
                    // The producer has reserved this slot but not yet
                    // stored into it.
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// An unbounded FIFO built from rings of doubling capacity. Producers push
/// into the newest ring; the consumer drains the oldest and then advances.
///
/// Rings stay linked until the chain is dropped, so a producer holding a
/// stale ring reference can never touch freed memory.
pub(crate) struct BufChain {
    head: AtomicPtr<BufDequeue>,
    tail: AtomicPtr<BufDequeue>,
    first: *mut BufDequeue,
}

// Safety: the raw pointers all come from `Box::into_raw` and are only freed
// in `drop`, which has exclusive access. The rings themselves are Sync.
unsafe impl Send for BufChain {}
unsafe impl Sync for BufChain {}

impl BufChain {
    pub(crate) fn new(capacity: usize) -> Self {
        let ring = Box::into_raw(Box::new(BufDequeue::with_capacity(capacity)));
        Self {
            head: AtomicPtr::new(ring),
            tail: AtomicPtr::new(ring),
            first: ring,
        }
    }

    /// Append a node, growing the chain when the newest ring is full.
    pub(crate) fn push_head(&self, val: *mut ListElement) {
        loop {
            let ring_ptr = self.head.load(Ordering::Acquire);
            // Safety: rings are never freed while the chain is alive.
            let ring = unsafe { &*ring_ptr };
            if ring.push_head(val) {
                return;
            }
            let capacity = (ring.capacity() * 2).min(MAXIMUM_RING_CAPACITY);
            let fresh = Box::into_raw(Box::new(BufDequeue::with_capacity(capacity)));
            match self
                .head
                .compare_exchange(ring_ptr, fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                // Link the old ring to its successor for the consumer.
                Ok(_) => ring.next.store(fresh, Ordering::Release),
                // Another producer grew the chain first.
                Err(_) => drop(unsafe { Box::from_raw(fresh) }),
            }
        }
    }

    /// Take the oldest node, following drained rings forward.
    pub(crate) fn pop_tail(&self) -> Option<*mut ListElement> {
        loop {
            let ring_ptr = self.tail.load(Ordering::Acquire);
            // Safety: rings are never freed while the chain is alive.
            let ring = unsafe { &*ring_ptr };
            if let Some(val) = ring.pop_tail() {
                return Some(val);
            }
            let next = ring.next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            // The old ring is drained and sealed (a successor exists only
            // once it filled); only the cursor moves, the ring itself is
            // reclaimed in `drop`.
            let _ = self
                .tail
                .compare_exchange(ring_ptr, next, Ordering::AcqRel, Ordering::Relaxed);
        }
    }
}

impl Drop for BufChain {
    fn drop(&mut self) {
        while let Some(val) = self.pop_tail() {
            // Safety: pointers in the chain always come from `Box::into_raw`.
            drop(unsafe { Box::from_raw(val) });
        }
        let mut ring = self.first;
        while !ring.is_null() {
            // Safety: every ring was leaked from a `Box` in `push_head` or
            // `new` and is reachable exactly once via the `next` links.
            let next = unsafe { (*ring).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(ring) });
            ring = next;
        }
    }
}

/// The awaitable facade over [`BufChain`] used as a stream's receive queue.
/// Tracks buffered payload bytes, an optional absolute pop deadline
/// (enforced by the polling side), and a stop flag that turns an empty
/// queue into end-of-stream.
pub(crate) struct ReceiveQueue {
    chain: BufChain,
    length: AtomicU32,
    stopped: AtomicBool,
    /// The single popper parked on an empty queue.
    waker: AtomicWaker,
    deadline: Mutex<Option<Instant>>,
}

impl ReceiveQueue {
    pub(crate) fn new() -> Self {
        Self {
            chain: BufChain::new(INITIAL_RING_CAPACITY),
            length: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            deadline: Mutex::new(None),
        }
    }

    /// Buffered payload bytes.
    pub(crate) fn len(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    /// Append an element and wake the popper.
    pub(crate) fn push(&self, element: Box<ListElement>) {
        self.length.fetch_add(u32::from(element.len), Ordering::AcqRel);
        self.chain.push_head(Box::into_raw(element));
        self.waker.wake();
    }

    /// Non-blocking pop; `None` when nothing is queued.
    pub(crate) fn try_pop(&self) -> Option<Box<ListElement>> {
        self.chain.pop_tail().map(|val| {
            // Safety: the chain only ever holds pointers from `Box::into_raw`.
            let element = unsafe { Box::from_raw(val) };
            self.length.fetch_sub(u32::from(element.len), Ordering::AcqRel);
            element
        })
    }

    /// Pop, parking the task while the queue is empty. `Ready(None)` means
    /// the queue was stopped and has fully drained: end of stream. The pop
    /// deadline is the caller's to enforce, via [`Self::deadline`].
    pub(crate) fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Box<ListElement>>> {
        if let Some(element) = self.try_pop() {
            return Poll::Ready(Some(element));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        self.waker.register(cx.waker());
        // Re-check: a push or stop may have landed before the waker was in
        // place.
        if let Some(element) = self.try_pop() {
            return Poll::Ready(Some(element));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }

    /// The current absolute pop deadline.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Set or clear the absolute pop deadline, waking a parked popper so
    /// it re-arms against the new instant.
    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
        self.waker.wake();
    }

    /// No more data will be pushed; unblock the popper once drained.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
    }
}
