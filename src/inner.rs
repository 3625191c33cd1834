//! Multiplexer internals: the frame dispatch loop, the write serializer,
//! keepalive pings, and the stream table.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::bandwidth::Estimator;
use crate::config::MuxConfig;
use crate::dupe::Dupe;
use crate::error::Error;
use crate::frame::{self, Body, FinalizedFrame, RecvFrame};
use crate::pool;
use crate::stream::MuxStream;
use crate::timing::OptionalInterval;
use crate::window::{ReceiveWindow, SendWindow};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// The shared halves of one live stream, kept in the stream table so the
/// dispatch loop can reach them while the user holds the endpoint.
pub(crate) struct StreamData {
    pub(crate) recv: Arc<ReceiveWindow>,
    pub(crate) send: Arc<SendWindow>,
    /// Raised when the peer closes its end.
    pub(crate) closing: Arc<AtomicBool>,
}

impl StreamData {
    fn new(mux: &Arc<MuxInner>) -> Self {
        Self {
            recv: Arc::new(ReceiveWindow::new(Arc::downgrade(mux))),
            send: Arc::new(SendWindow::new(Arc::downgrade(mux))),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Dupe for StreamData {
    #[inline]
    fn dupe(&self) -> Self {
        Self {
            recv: self.recv.dupe(),
            send: self.send.dupe(),
            closing: self.closing.dupe(),
        }
    }
}

/// One slot in the stream table.
pub(crate) enum FlowSlot {
    /// We sent an open request and await the peer's verdict. The sender
    /// delivers the established windows, or `None` on refusal.
    Requested(oneshot::Sender<Option<StreamData>>),
    /// The stream is live.
    Established(StreamData),
}

/// State shared by the mux handle, its tasks, and every stream endpoint.
/// Endpoints hold this weakly; the mux and its tasks own it.
pub(crate) struct MuxInner {
    frame_tx: mpsc::UnboundedSender<FinalizedFrame>,
    pub(crate) flows: RwLock<HashMap<i32, FlowSlot>>,
    accept_tx: mpsc::Sender<MuxStream>,
    pub(crate) estimator: Estimator,
    closed: AtomicBool,
    shutdown: Notify,
    /// Stream ids we hand out; wraps within the positive range and skips
    /// ids still in the table.
    id_counter: AtomicI32,
    /// Microseconds since `epoch` when the last pong arrived.
    last_pong_micros: AtomicU64,
    epoch: Instant,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    config: MuxConfig,
}

impl MuxInner {
    pub(crate) fn new(
        frame_tx: mpsc::UnboundedSender<FinalizedFrame>,
        accept_tx: mpsc::Sender<MuxStream>,
        estimator: Estimator,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        config: MuxConfig,
    ) -> Self {
        Self {
            frame_tx,
            flows: RwLock::new(HashMap::new()),
            accept_tx,
            estimator,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            id_counter: AtomicI32::new(0),
            last_pong_micros: AtomicU64::new(0),
            epoch: Instant::now(),
            local_addr,
            peer_addr,
            config,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Live entries in the stream table, dialing ones included.
    pub(crate) fn stream_count(&self) -> usize {
        self.flows.read().len()
    }

    /// Queue one frame for the write serializer.
    pub(crate) fn send_frame(&self, frame: FinalizedFrame) -> Result<(), Error> {
        self.frame_tx.send(frame).map_err(|_| Error::Closed)
    }

    pub(crate) fn remove_stream(&self, id: i32) {
        self.flows.write().remove(&id);
    }

    /// Completes once the mux is closed.
    pub(crate) async fn closed_wait(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Shut the mux down: close every stream (without telling the peer
    /// stream by stream), wake everything blocked, let the tasks drop the
    /// transport. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("mux closing");
        self.shutdown.notify_waiters();
        let flows = std::mem::take(&mut *self.flows.write());
        for (_, slot) in flows {
            match slot {
                FlowSlot::Established(data) => {
                    data.closing.store(true, Ordering::Release);
                    data.send.close_window();
                    data.recv.close_window();
                }
                // Dropping the sender fails the pending dial with `Closed`.
                FlowSlot::Requested(_) => {}
            }
        }
    }

    /// Pick a free nonzero id. One full lap of candidates means the table
    /// is saturated.
    fn allocate_id(&self) -> Result<i32, Error> {
        let flows = self.flows.read();
        for _ in 0..flows.len() + 2 {
            let prev = self
                .id_counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(if v == i32::MAX { 0 } else { v + 1 })
                });
            let (Ok(prev) | Err(prev)) = prev;
            let id = if prev == i32::MAX { 0 } else { prev + 1 };
            if id != 0 && !flows.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Capacity)
    }

    /// Dial: ask the peer for a new stream and wait for its verdict, the
    /// dial timeout, or mux shutdown.
    pub(crate) async fn open_stream(self: &Arc<Self>) -> Result<MuxStream, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.allocate_id()?;
        let (verdict_tx, verdict_rx) = oneshot::channel();
        self.flows.write().insert(id, FlowSlot::Requested(verdict_tx));
        trace!("dialing stream {id}");
        if self
            .send_frame(FinalizedFrame::control(frame::NEW_CONN, id))
            .is_err()
        {
            self.remove_stream(id);
            return Err(Error::Closed);
        }
        let verdict = tokio::select! {
            verdict = verdict_rx => verdict,
            () = self.closed_wait() => {
                self.remove_stream(id);
                return Err(Error::Closed);
            }
            () = tokio::time::sleep(self.config.dial_timeout) => {
                self.remove_stream(id);
                return Err(Error::Timeout);
            }
        };
        match verdict {
            Ok(Some(data)) => Ok(MuxStream::new(id, Arc::downgrade(self), data)),
            Ok(None) => Err(Error::Capacity),
            // The slot was dropped during shutdown.
            Err(_) => Err(Error::Closed),
        }
    }

    /// Route one decoded frame. A protocol-level surprise is terminal.
    fn dispatch(self: &Arc<Self>, frame: RecvFrame) -> Result<(), Error> {
        let RecvFrame { id, body } = frame;
        match body {
            Body::Open => self.on_open(id),
            Body::OpenOk => {
                self.on_open_verdict(id, true);
                Ok(())
            }
            Body::OpenFail => {
                self.on_open_verdict(id, false);
                Ok(())
            }
            Body::Data { buf, len, part } => {
                self.estimator.on_read(len);
                let data = match self.flows.read().get(&id) {
                    Some(FlowSlot::Established(data)) => Some(data.dupe()),
                    _ => None,
                };
                match data {
                    Some(data) => {
                        if data.recv.write(buf, len, part, id).is_err() {
                            trace!("data for closing stream {id} dropped");
                        }
                    }
                    None => {
                        trace!("data for unknown stream {id} dropped");
                        pool::window_buffers().put(buf);
                    }
                }
                Ok(())
            }
            Body::Credit(remaining) => {
                let data = match self.flows.read().get(&id) {
                    Some(FlowSlot::Established(data)) => Some(data.dupe()),
                    _ => None,
                };
                match data {
                    Some(data) => data.send.set_credit(remaining),
                    // A stale advertisement racing our close.
                    None => trace!("credit for unknown stream {id} ignored"),
                }
                Ok(())
            }
            Body::Close => {
                self.on_remote_close(id);
                Ok(())
            }
            Body::Ping { buf, len } => {
                let reply = FinalizedFrame::pong(&buf[..usize::from(len)]);
                pool::window_buffers().put(buf);
                let _ = self.send_frame(reply);
                Ok(())
            }
            Body::Pong { buf, len } => {
                self.record_pong(&buf[..usize::from(len)]);
                pool::window_buffers().put(buf);
                Ok(())
            }
        }
    }

    /// The peer wants a new stream.
    fn on_open(self: &Arc<Self>, id: i32) -> Result<(), Error> {
        if self.accept_tx.capacity() == 0 {
            debug!("accept backlog full; refusing stream {id}");
            return self.send_frame(FinalizedFrame::control(frame::NEW_CONN_FAIL, id));
        }
        let data = StreamData::new(self);
        {
            let mut flows = self.flows.write();
            if flows.contains_key(&id) {
                drop(flows);
                warn!("peer reused live stream id {id}");
                return self.send_frame(FinalizedFrame::control(frame::NEW_CONN_FAIL, id));
            }
            flows.insert(id, FlowSlot::Established(data.dupe()));
        }
        // Acknowledge before the user can touch the stream, so our ack
        // precedes any data they write.
        self.send_frame(FinalizedFrame::control(frame::NEW_CONN_OK, id))?;
        debug!("accepted stream {id}");
        let stream = MuxStream::new(id, Arc::downgrade(self), data);
        if let Err(e) = self.accept_tx.try_send(stream) {
            // Capacity was checked above; only a closing mux gets here.
            debug!("accept queue rejected stream {id}: {e}");
            self.remove_stream(id);
        }
        Ok(())
    }

    /// The peer answered one of our open requests.
    fn on_open_verdict(self: &Arc<Self>, id: i32, ok: bool) {
        let mut flows = self.flows.write();
        match flows.remove(&id) {
            Some(FlowSlot::Requested(verdict_tx)) => {
                if ok {
                    let data = StreamData::new(self);
                    flows.insert(id, FlowSlot::Established(data.dupe()));
                    drop(flows);
                    debug!("stream {id} established");
                    if verdict_tx.send(Some(data)).is_err() {
                        // The dialer gave up (timeout or shutdown); undo.
                        self.remove_stream(id);
                        let _ =
                            self.send_frame(FinalizedFrame::control(frame::CONN_CLOSE, id));
                    }
                } else {
                    drop(flows);
                    debug!("peer refused stream {id}");
                    let _ = verdict_tx.send(None);
                }
            }
            Some(established) => {
                // Bogus verdict for a live stream; put it back.
                flows.insert(id, established);
                warn!("open verdict for established stream {id}");
            }
            None => warn!("open verdict for unknown stream {id}"),
        }
    }

    /// The peer closed a stream: buffered data stays readable, writes from
    /// here fail, and no close is echoed back.
    fn on_remote_close(&self, id: i32) {
        let removed = self.flows.write().remove(&id);
        match removed {
            Some(FlowSlot::Established(data)) => {
                debug!("stream {id} closed by peer");
                data.closing.store(true, Ordering::Release);
                data.recv.stop();
            }
            Some(FlowSlot::Requested(_)) => {
                // Dropping the sender fails the dial.
                debug!("peer cancelled stream {id} mid-open");
            }
            None => trace!("close for unknown stream {id}"),
        }
    }

    fn record_pong(&self, payload: &[u8]) {
        let now_micros = self.epoch.elapsed().as_micros() as u64;
        self.last_pong_micros.store(now_micros, Ordering::Release);
        if let Ok(stamp) = <[u8; 8]>::try_from(payload) {
            let sent_micros = u64::from_le_bytes(stamp);
            let rtt = Duration::from_micros(now_micros.saturating_sub(sent_micros));
            self.estimator.on_pong(rtt);
        }
    }

    /// True when the peer has not answered pings for the configured number
    /// of intervals.
    fn pong_overdue(&self) -> bool {
        let Some(interval) = self.config.keepalive_interval.get() else {
            return false;
        };
        let allowance = interval * self.config.ping_timeout_intervals;
        let now_micros = self.epoch.elapsed().as_micros() as u64;
        let last = self.last_pong_micros.load(Ordering::Acquire);
        now_micros.saturating_sub(last) > allowance.as_micros() as u64
    }
}

/// Read frames off the transport and dispatch until error or shutdown.
pub(crate) async fn reader_task<R>(inner: Arc<MuxInner>, mut read_half: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            () = inner.closed_wait() => break,
            frame = frame::read_frame(&mut read_half) => {
                let result = frame.and_then(|frame| inner.dispatch(frame));
                if let Err(e) = result {
                    debug!("mux reader finished: {e}");
                    inner.close();
                    break;
                }
            }
        }
    }
    // Dropping the read half here and the write half in the writer closes
    // the transport.
}

/// Drain the frame queue onto the transport one frame at a time, and emit
/// keepalive pings. The single consumer keeps the byte stream linear.
pub(crate) async fn writer_task<W>(
    inner: Arc<MuxInner>,
    mut write_half: W,
    mut frame_rx: mpsc::UnboundedReceiver<FinalizedFrame>,
) where
    W: AsyncWrite + Unpin,
{
    let mut keepalive = OptionalInterval::from(inner.config.keepalive_interval);
    // A missed tick means the link was busy; no need to make it up.
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = inner.closed_wait() => break,
            _ = keepalive.tick() => {
                if inner.pong_overdue() {
                    warn!("peer stopped answering pings");
                    inner.close();
                    break;
                }
                let stamp = inner.epoch.elapsed().as_micros() as u64;
                let frame = FinalizedFrame::ping(&stamp.to_le_bytes());
                if let Err(e) = write_frame(&mut write_half, frame).await {
                    debug!("mux writer finished: {e}");
                    inner.close();
                    break;
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut write_half, frame).await {
                    debug!("mux writer finished: {e}");
                    inner.close();
                    break;
                }
            }
        }
    }
}

async fn write_frame<W>(write_half: &mut W, frame: FinalizedFrame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_half.write_all(&frame.0).await?;
    write_half.flush().await?;
    frame.recycle();
    Ok(())
}
