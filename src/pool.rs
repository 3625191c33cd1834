//! Process-wide object pools for window buffers, frame encode buffers, and
//! receive-queue nodes.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{POOL_MAX_IDLE, POOL_SIZE_BUFFER, POOL_SIZE_WINDOW};
use crate::queue::ListElement;
use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// A fixed-size payload region handed out by [`window_buffers`]. The length
/// is always `POOL_SIZE_WINDOW`; users track how much of it is meaningful.
pub(crate) type WindowBuf = Box<[u8]>;

/// A thread-safe free list with a factory for misses and a reset applied on
/// every return. Objects must not retain references to previously held
/// payloads once reset.
pub(crate) struct Pool<T> {
    free: Mutex<Vec<T>>,
    new: fn() -> T,
    reset: fn(&mut T),
}

impl<T> Pool<T> {
    fn new(new: fn() -> T, reset: fn(&mut T)) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            new,
            reset,
        }
    }

    /// Take an idle object or create a fresh one.
    pub(crate) fn get(&self) -> T {
        let recycled = self.free.lock().pop();
        recycled.unwrap_or_else(self.new)
    }

    /// Reset and return an object. Surplus beyond the idle cap is dropped.
    pub(crate) fn put(&self, mut object: T) {
        (self.reset)(&mut object);
        let mut free = self.free.lock();
        if free.len() < POOL_MAX_IDLE {
            free.push(object);
        }
    }
}

static WINDOW_BUFFERS: Lazy<Pool<WindowBuf>> = Lazy::new(|| {
    Pool::new(
        || vec![0u8; POOL_SIZE_WINDOW].into_boxed_slice(),
        // Fixed-length regions come back at full capacity by construction.
        |_| {},
    )
});

static FRAME_BUFFERS: Lazy<Pool<BytesMut>> =
    Lazy::new(|| Pool::new(|| BytesMut::with_capacity(POOL_SIZE_BUFFER), BytesMut::clear));

static LIST_ELEMENTS: Lazy<Pool<Box<ListElement>>> =
    Lazy::new(|| Pool::new(|| Box::new(ListElement::default()), |e| e.reset()));

/// The pool of fixed-size payload regions.
pub(crate) fn window_buffers() -> &'static Pool<WindowBuf> {
    &WINDOW_BUFFERS
}

/// The pool of frame encode buffers fed to the write serializer.
pub(crate) fn frame_buffers() -> &'static Pool<BytesMut> {
    &FRAME_BUFFERS
}

/// The pool of receive-queue nodes.
pub(crate) fn list_elements() -> &'static Pool<Box<ListElement>> {
    &LIST_ELEMENTS
}
