//! Per-stream flow control: the receive window that buffers inbound
//! segments and advertises credit, and the send window that spends it.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{INITIAL_WINDOW_SIZE, MAXIMUM_SEGMENT_SIZE, MAXIMUM_WINDOW_SIZE};
use crate::error::Error;
use crate::frame::FinalizedFrame;
use crate::inner::MuxInner;
use crate::pool::{self, WindowBuf};
use crate::queue::ReceiveQueue;
use crate::timing::DeadlineTimer;
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::time::Instant;

/// Pack the credit pair into one word: remaining in the high half, the
/// wakeup-owed bit in the low half. The pair must change atomically so a
/// wakeup is never granted and recorded separately.
const fn pack(remaining: u32, wait: u32) -> u64 {
    ((remaining as u64) << 32) | wait as u64
}

const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// The receive-window target for the next sizing pass: what the link could
/// deliver in one round trip, split across streams, clamped to move at most
/// an octave from the current size and to stay inside the global cap.
fn next_size(max_size: u32, buffered: u32, conns: u32, latency: f64, bandwidth: f64) -> u32 {
    let mut n = (latency * bandwidth / f64::from(conns)) as u32;
    n = n.max(INITIAL_WINDOW_SIZE);
    n = n.max(buffered);
    n = n.max(max_size / 2);
    n = n.min(max_size.saturating_mul(2));
    n = n.min(MAXIMUM_WINDOW_SIZE / conns);
    n
}

/// The reader-side cursor over the element currently being drained. Owned
/// by the stream endpoint so reads need no extra synchronization.
#[derive(Debug, Default)]
pub(crate) struct ReadCursor {
    pub(crate) element: Option<Box<crate::queue::ListElement>>,
    pub(crate) off: usize,
}

impl ReadCursor {
    /// Return the in-flight element and its buffer to their pools.
    pub(crate) fn release(&mut self) {
        if let Some(mut element) = self.element.take() {
            if let Some(buf) = element.buf.take() {
                pool::window_buffers().put(buf);
            }
            pool::list_elements().put(element);
        }
        self.off = 0;
    }
}

/// Inbound half of a stream: buffers segments from the mux reader and
/// returns credit to the peer as the application drains them.
pub(crate) struct ReceiveWindow {
    queue: ReceiveQueue,
    max_size: AtomicU32,
    remaining_wait: AtomicU64,
    close_op: AtomicBool,
    /// Sizing cadence: recompute only when this hits zero, then rewind.
    calc_count: AtomicI8,
    mux: Weak<MuxInner>,
}

impl ReceiveWindow {
    pub(crate) fn new(mux: Weak<MuxInner>) -> Self {
        Self {
            queue: ReceiveQueue::new(),
            max_size: AtomicU32::new(INITIAL_WINDOW_SIZE),
            remaining_wait: AtomicU64::new(pack(0, 0)),
            close_op: AtomicBool::new(false),
            calc_count: AtomicI8::new(0),
            mux,
        }
    }

    /// Window room left after the queued bytes and an incoming `delta`.
    fn remaining_size(&self, delta: u16) -> u32 {
        let room = i64::from(self.max_size.load(Ordering::Acquire))
            - i64::from(self.queue.len())
            - i64::from(delta);
        room.max(0) as u32
    }

    fn calc_size(&self) {
        if self.calc_count.load(Ordering::Relaxed) == 0 {
            if let Some(mux) = self.mux.upgrade() {
                let conns = (mux.stream_count().max(1)) as u32;
                let next = next_size(
                    self.max_size.load(Ordering::Acquire),
                    self.queue.len(),
                    conns,
                    mux.estimator.latency(),
                    mux.estimator.read_bandwidth(),
                );
                self.max_size.store(next, Ordering::Release);
            }
            self.calc_count.store(-10, Ordering::Relaxed);
        }
        self.calc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Accept one inbound segment from the mux reader. Publishes the new
    /// remaining room to the peer unless the window just ran dry, in which
    /// case the wakeup-owed bit is raised instead and credit flows again
    /// from the read side.
    pub(crate) fn write(&self, buf: WindowBuf, len: u16, part: bool, id: i32) -> Result<(), Error> {
        if self.close_op.load(Ordering::Acquire) {
            pool::window_buffers().put(buf);
            return Err(Error::Closed);
        }
        self.calc_size();
        let mut element = pool::list_elements().get();
        element.buf = Some(buf);
        element.len = len;
        element.part = part;
        let (wait, new_remaining) = loop {
            let word = self.remaining_wait.load(Ordering::Acquire);
            let (_, mut wait) = unpack(word);
            let new_remaining = self.remaining_size(len);
            if new_remaining == 0 {
                wait = 1;
            }
            if self
                .remaining_wait
                .compare_exchange(word, pack(0, wait), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (wait, new_remaining);
            }
        };
        self.queue.push(element);
        if wait == 0 {
            self.send_credit(id, new_remaining);
        }
        Ok(())
    }

    /// Copy buffered bytes into `dst`, returning whatever is available once
    /// at least one byte has been copied and parking the task when nothing
    /// is. Keeps copying across elements while the producer marked them as
    /// parts of one larger write and `dst` has room.
    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        cursor: &mut ReadCursor,
        timer: &mut DeadlineTimer,
        dst: &mut [u8],
        id: i32,
    ) -> Poll<Result<usize, Error>> {
        if self.close_op.load(Ordering::Acquire) {
            return Poll::Ready(Ok(0));
        }
        if dst.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut n = 0usize;
        loop {
            let drained = cursor
                .element
                .as_ref()
                .map_or(true, |element| cursor.off >= usize::from(element.len));
            if drained {
                if let Some(element) = cursor.element.take() {
                    pool::list_elements().put(element);
                }
                if self.close_op.load(Ordering::Acquire) {
                    return Poll::Ready(Ok(n));
                }
                match self.queue.poll_pop(cx) {
                    Poll::Ready(Some(element)) => {
                        cursor.off = 0;
                        cursor.element = Some(element);
                    }
                    Poll::Ready(None) => {
                        // End of stream; release whatever is left over.
                        self.close_window();
                        return Poll::Ready(Ok(n));
                    }
                    Poll::Pending if n > 0 => return Poll::Ready(Ok(n)),
                    Poll::Pending => {
                        if timer.poll_expired(cx, self.queue.deadline()) {
                            return Poll::Ready(Err(Error::Timeout));
                        }
                        return Poll::Pending;
                    }
                }
            }
            let element = cursor
                .element
                .as_mut()
                .expect("receive cursor refilled above (this is a bug)");
            let len = usize::from(element.len);
            let want = (len - cursor.off).min(dst.len() - n);
            if want > 0 {
                let src = element
                    .buf
                    .as_ref()
                    .expect("undrained element retains its buffer (this is a bug)");
                dst[n..n + want].copy_from_slice(&src[cursor.off..cursor.off + want]);
                n += want;
                cursor.off += want;
            }
            if cursor.off == len {
                // Fully drained: the buffer goes home and the freed bytes
                // become credit.
                if let Some(buf) = element.buf.take() {
                    pool::window_buffers().put(buf);
                    self.send_status(id, element.len);
                }
            }
            if n < dst.len() && element.part {
                continue;
            }
            return Poll::Ready(Ok(n));
        }
    }

    /// Account `drained` bytes back into the window and clear the
    /// wakeup-owed bit; if it was raised, the peer is starving and gets a
    /// credit frame now.
    fn send_status(&self, id: i32, drained: u16) {
        let (remaining, wait) = loop {
            let word = self.remaining_wait.load(Ordering::Acquire);
            let (remaining, wait) = unpack(word);
            let remaining = remaining.saturating_add(u32::from(drained));
            if self
                .remaining_wait
                .compare_exchange(word, pack(remaining, 0), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (remaining, wait);
            }
            std::hint::spin_loop();
        };
        if wait == 1 {
            self.send_credit(id, remaining);
        }
    }

    fn send_credit(&self, id: i32, remaining: u32) {
        if let Some(mux) = self.mux.upgrade() {
            let _ = mux.send_frame(FinalizedFrame::credit(id, remaining));
        }
    }

    /// Forward the pop deadline to the queue.
    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        self.queue.set_deadline(deadline);
    }

    /// No more data will arrive; pending reads drain and then see EOF.
    pub(crate) fn stop(&self) {
        self.queue.stop();
    }

    /// Tear the window down: reads return EOF at once and everything still
    /// queued goes back to the pools.
    pub(crate) fn close_window(&self) {
        if !self.close_op.swap(true, Ordering::AcqRel) {
            self.queue.stop();
            self.release();
        }
    }

    fn release(&self) {
        while let Some(mut element) = self.queue.try_pop() {
            if let Some(buf) = element.buf.take() {
                pool::window_buffers().put(buf);
            }
            pool::list_elements().put(element);
        }
    }
}

/// Outbound half of a stream: meters segments against the credit the peer
/// has advertised.
pub(crate) struct SendWindow {
    remaining_wait: AtomicU64,
    close_op: AtomicBool,
    /// The single writer parked on zero credit. A wakeup is owed to it at
    /// most once, tracked by the wait bit.
    waker: AtomicWaker,
    deadline: Mutex<Option<Instant>>,
    mux: Weak<MuxInner>,
}

impl SendWindow {
    pub(crate) fn new(mux: Weak<MuxInner>) -> Self {
        Self {
            remaining_wait: AtomicU64::new(pack(INITIAL_WINDOW_SIZE, 0)),
            close_op: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            deadline: Mutex::new(None),
            mux,
        }
    }

    /// Adopt a credit advertisement from the peer. A re-advertisement of
    /// the value we already hold is ignored; zero credit while a wakeup is
    /// owed keeps the writer parked.
    pub(crate) fn set_credit(&self, new_remaining: u32) {
        if self.close_op.load(Ordering::Acquire) {
            self.waker.wake();
            return;
        }
        let wait = loop {
            let word = self.remaining_wait.load(Ordering::Acquire);
            let (remaining, wait) = unpack(word);
            if remaining == new_remaining {
                return;
            }
            let new_wait = u32::from(new_remaining == 0 && wait == 1);
            if self
                .remaining_wait
                .compare_exchange(word, pack(new_remaining, new_wait), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break wait;
            }
        };
        if wait == 1 {
            self.waker.wake();
        }
    }

    /// Ship as much of `buf` as current credit allows, as data frames
    /// through the mux serializer. Returns the bytes accepted; parks the
    /// task (raising the wait bit) only when nothing can be sent at all.
    pub(crate) fn poll_write(
        &self,
        cx: &mut Context<'_>,
        timer: &mut DeadlineTimer,
        buf: &[u8],
        id: i32,
    ) -> Poll<Result<usize, Error>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut sent = 0usize;
        loop {
            if self.close_op.load(Ordering::Acquire) {
                return Poll::Ready(Err(Error::Closed));
            }
            let word = self.remaining_wait.load(Ordering::Acquire);
            let (remaining, _) = unpack(word);
            if remaining == 0 {
                if sent > 0 {
                    return Poll::Ready(Ok(sent));
                }
                if self
                    .remaining_wait
                    .compare_exchange(word, pack(0, 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                self.waker.register(cx.waker());
                // Re-check: credit or close may have landed before the
                // waker was in place.
                if self.close_op.load(Ordering::Acquire) {
                    return Poll::Ready(Err(Error::Closed));
                }
                let (remaining, _) = unpack(self.remaining_wait.load(Ordering::Acquire));
                if remaining != 0 {
                    continue;
                }
                if timer.poll_expired(cx, self.deadline()) {
                    return Poll::Ready(Err(Error::Timeout));
                }
                return Poll::Pending;
            }
            let left = buf.len() - sent;
            let send = left.min(MAXIMUM_SEGMENT_SIZE).min(remaining as usize);
            let part = send < left;
            // Only the high (remaining) half changes: remaining >= send.
            self.remaining_wait
                .fetch_sub((send as u64) << 32, Ordering::AcqRel);
            let Some(mux) = self.mux.upgrade() else {
                return Poll::Ready(Err(Error::Closed));
            };
            if let Err(e) = mux.send_frame(FinalizedFrame::data(id, &buf[sent..sent + send], part)) {
                return Poll::Ready(Err(e));
            }
            sent += send;
            if sent == buf.len() {
                return Poll::Ready(Ok(sent));
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Set or clear the write deadline. Applies from the next credit wait.
    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    pub(crate) fn close_window(&self) {
        if !self.close_op.swap(true, Ordering::AcqRel) {
            self.waker.wake();
        }
    }
}
