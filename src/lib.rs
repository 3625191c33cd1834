//! Many independent, bidirectional, reliable byte streams over one
//! reliable, ordered transport (typically a single TCP connection), with
//! per-stream flow control and receive windows sized from measured
//! bandwidth and latency.
//!
//! Create a [`Mux`] on each end of a transport, then [`Mux::new_stream`] on
//! one side and [`Mux::accept`] on the other. Streams implement
//! [`AsyncRead`] and [`AsyncWrite`]; hand one to [`tokio::io::split`] to
//! read and write it concurrently from different tasks.
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> braid_mux::Result<()> {
//! use braid_mux::{Mux, Role};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let (a, b) = tokio::io::duplex(65536);
//! let left = Mux::new(a, Role::Tcp);
//! let right = Mux::new(b, Role::Tcp);
//! let (dialed, accepted) = tokio::join!(left.new_stream(), right.accept());
//! let (mut dialed, mut accepted) = (dialed?, accepted?);
//! dialed.write_all(b"hello").await?;
//! let mut buf = [0u8; 5];
//! accepted.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```
//!
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]

mod bandwidth;
mod config;
mod dupe;
mod error;
mod frame;
mod inner;
mod pool;
mod queue;
mod stream;
mod timing;
mod window;

pub use crate::config::MuxConfig;
pub use crate::error::{Error, Result};
pub use crate::stream::MuxStream;
pub use crate::timing::OptionalDuration;

use crate::bandwidth::Estimator;
use crate::dupe::Dupe;
use crate::inner::MuxInner;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// What a mux runs on: any reliable, ordered, bidirectional byte stream.
/// Address introspection is optional and purely informational.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// The local address of the transport, if it has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// The remote address of the transport, if it has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// In-memory transport, mostly useful in tests.
impl Transport for DuplexStream {}

/// What kind of link carries the mux. On wall-clock links (`Tcp`) ping
/// times and read rates feed the receive-window sizer; on others the sizer
/// falls back to its floors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// A TCP-like link whose wall-clock timing is meaningful.
    #[default]
    Tcp,
    /// A link with its own retransmission timing the estimator should not
    /// trust.
    Kcp,
}

/// A stream multiplexer over one transport.
///
/// The mux owns the transport and runs a reader, a write serializer, and a
/// keepalive pinger as background tasks. It shuts down on [`Mux::close`],
/// on drop, on any transport or protocol error, and when the peer stops
/// answering pings; shutdown closes every open stream.
pub struct Mux {
    inner: Arc<MuxInner>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
}

impl Mux {
    /// Run a mux over `transport` with default [`MuxConfig`].
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(transport: impl Transport, role: Role) -> Self {
        Self::with_config(transport, role, MuxConfig::default())
    }

    /// Run a mux over `transport` with an explicit configuration.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_config(transport: impl Transport, role: Role, config: MuxConfig) -> Self {
        let local_addr = transport.local_addr();
        let peer_addr = transport.peer_addr();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let inner = Arc::new(MuxInner::new(
            frame_tx,
            accept_tx,
            Estimator::new(role == Role::Tcp),
            local_addr,
            peer_addr,
            config,
        ));
        let (read_half, write_half) = tokio::io::split(transport);
        tokio::spawn(inner::reader_task(inner.dupe(), read_half));
        tokio::spawn(inner::writer_task(inner.dupe(), write_half, frame_rx));
        Self {
            inner,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// Open a new stream to the peer. Waits for the peer's verdict, bounded
    /// by the configured dial timeout.
    ///
    /// # Errors
    /// [`Error::Capacity`] if the peer refuses or the id space is
    /// saturated; [`Error::Timeout`] if the peer does not answer in time;
    /// [`Error::Closed`] if the mux is (or goes) down.
    pub async fn new_stream(&self) -> Result<MuxStream> {
        self.inner.open_stream().await
    }

    /// Wait for the peer to open a stream.
    ///
    /// # Errors
    /// [`Error::Closed`] once the mux shuts down.
    pub async fn accept(&self) -> Result<MuxStream> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(Error::Closed),
            () = self.inner.closed_wait() => Err(Error::Closed),
        }
    }

    /// Shut the mux down, closing every stream. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether the mux has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Streams currently tracked, dialing ones included.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.stream_count()
    }

    /// The smoothed inbound data rate in bytes per second.
    #[must_use]
    pub fn read_bandwidth(&self) -> f64 {
        self.inner.estimator.read_bandwidth()
    }

    /// The smoothed one-way latency in seconds; zero before the first pong.
    #[must_use]
    pub fn latency(&self) -> f64 {
        self.inner.estimator.latency()
    }

    /// The local address of the transport, if it has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    /// The peer address of the transport, if it has one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("closed", &self.is_closed())
            .field("active_streams", &self.active_streams())
            .finish_non_exhaustive()
    }
}
