//! A virtual connection: one bidirectional byte stream inside a mux, with
//! the deadline semantics of an ordinary stream socket.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::Error;
use crate::frame::{self, FinalizedFrame};
use crate::inner::{MuxInner, StreamData};
use crate::timing::DeadlineTimer;
use crate::window::{ReadCursor, ReceiveWindow, SendWindow};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// One end of a virtual connection obtained from
/// [`Mux::new_stream`](crate::Mux::new_stream) or
/// [`Mux::accept`](crate::Mux::accept).
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]: reads wait until at least
/// one byte is available, writes wait while the peer has advertised no
/// receive-window credit. Pass the stream to [`tokio::io::split`] to read
/// and write concurrently from different tasks. Dropping the stream closes
/// it.
pub struct MuxStream {
    id: i32,
    inner: Weak<MuxInner>,
    recv: Arc<ReceiveWindow>,
    send: Arc<SendWindow>,
    /// Raised when the peer closes its end; writes then fail.
    closing: Arc<AtomicBool>,
    cursor: ReadCursor,
    read_timer: DeadlineTimer,
    write_timer: DeadlineTimer,
    closed: bool,
}

impl MuxStream {
    pub(crate) fn new(id: i32, inner: Weak<MuxInner>, data: StreamData) -> Self {
        Self {
            id,
            inner,
            recv: data.recv,
            send: data.send,
            closing: data.closing,
            cursor: ReadCursor::default(),
            read_timer: DeadlineTimer::default(),
            write_timer: DeadlineTimer::default(),
            closed: false,
        }
    }

    /// The stream id shared with the peer.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Close the stream. Idempotent; tells the peer unless the whole mux is
    /// already going away.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.close_process();
        }
    }

    fn close_process(&mut self) {
        self.cursor.release();
        if let Some(mux) = self.inner.upgrade() {
            mux.remove_stream(self.id);
            if !mux.is_closed() {
                let _ = mux.send_frame(FinalizedFrame::control(frame::CONN_CLOSE, self.id));
            }
        }
        self.send.close_window();
        self.recv.close_window();
    }

    /// Set both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Reads block no later than this instant; `None` removes the bound.
    /// A deadline in the past makes the next read time out immediately.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.recv.set_deadline(deadline);
    }

    /// Writes waiting for credit give up at this instant; `None` removes
    /// the bound.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.send.set_deadline(deadline);
    }

    /// The local address of the transport under the mux, if it has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.upgrade().and_then(|mux| mux.local_addr())
    }

    /// The peer address of the transport under the mux, if it has one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.upgrade().and_then(|mux| mux.peer_addr())
    }
}

impl AsyncRead for MuxStream {
    /// Filling zero bytes signals end of stream: the peer closed and the
    /// buffered data is drained. A read deadline surfaces as
    /// [`io::ErrorKind::TimedOut`].
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(Error::Closed.into()));
        }
        let dst = buf.initialize_unfilled();
        match this
            .recv
            .poll_read(cx, &mut this.cursor, &mut this.read_timer, dst, this.id)
        {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MuxStream {
    /// Accepts at most what the peer's advertised credit covers; callers
    /// loop (`write_all`) for full delivery.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(Error::Closed.into()));
        }
        if this.closing.load(Ordering::Acquire) {
            return Poll::Ready(Err(Error::WriteClosed.into()));
        }
        this.send
            .poll_write(cx, &mut this.write_timer, buf, this.id)
            .map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the mux serializer as they are carved;
        // there is no stream-local buffer to flush.
        Poll::Ready(Ok(()))
    }

    /// There is no half-close on the wire, so shutting down the write side
    /// closes the stream.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
