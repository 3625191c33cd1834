//! Wire framing: a five-byte header (flag, stream id) followed by a
//! flag-dependent body, all integers little-endian.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::MAXIMUM_SEGMENT_SIZE;
use crate::error::Error;
use crate::pool::{self, WindowBuf};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const PING: u8 = 0;
pub(crate) const NEW_CONN_OK: u8 = 1;
pub(crate) const NEW_CONN_FAIL: u8 = 2;
pub(crate) const NEW_MSG: u8 = 3;
pub(crate) const NEW_MSG_PART: u8 = 4;
pub(crate) const MSG_SEND_OK: u8 = 5;
pub(crate) const NEW_CONN: u8 = 6;
pub(crate) const CONN_CLOSE: u8 = 7;
pub(crate) const PING_RETURN: u8 = 8;

/// Stream id carried by ping and pong frames; real streams are nonzero.
pub(crate) const PING_ID: i32 = 0;

/// The decoded body of one inbound frame. Variants carrying a buffer own a
/// pooled region that the dispatcher must eventually return.
#[derive(Debug)]
pub(crate) enum Body {
    Open,
    OpenOk,
    OpenFail,
    Close,
    Credit(u32),
    Data { buf: WindowBuf, len: u16, part: bool },
    Ping { buf: WindowBuf, len: u16 },
    Pong { buf: WindowBuf, len: u16 },
}

/// One decoded inbound frame.
#[derive(Debug)]
pub(crate) struct RecvFrame {
    pub(crate) id: i32,
    pub(crate) body: Body,
}

/// Read exactly one frame. A short read anywhere fails the whole decode; a
/// declared payload length over the segment limit or an unknown flag is a
/// protocol error.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<RecvFrame, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    let flag = header[0];
    let id = i32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let body = match flag {
        NEW_CONN => Body::Open,
        NEW_CONN_OK => Body::OpenOk,
        NEW_CONN_FAIL => Body::OpenFail,
        CONN_CLOSE => Body::Close,
        MSG_SEND_OK => {
            let mut remaining = [0u8; 4];
            reader.read_exact(&mut remaining).await?;
            Body::Credit(u32::from_le_bytes(remaining))
        }
        NEW_MSG | NEW_MSG_PART | PING | PING_RETURN => {
            let mut length = [0u8; 2];
            reader.read_exact(&mut length).await?;
            let len = u16::from_le_bytes(length);
            if usize::from(len) > MAXIMUM_SEGMENT_SIZE {
                return Err(Error::Protocol("frame payload exceeds the segment limit"));
            }
            let mut buf = pool::window_buffers().get();
            if let Err(e) = reader.read_exact(&mut buf[..usize::from(len)]).await {
                pool::window_buffers().put(buf);
                return Err(e.into());
            }
            match flag {
                NEW_MSG => Body::Data { buf, len, part: false },
                NEW_MSG_PART => Body::Data { buf, len, part: true },
                PING => Body::Ping { buf, len },
                _ => Body::Pong { buf, len },
            }
        }
        _ => return Err(Error::Protocol("unknown frame flag")),
    };
    Ok(RecvFrame { id, body })
}

/// One encoded frame in a pooled buffer, ready for the write serializer.
/// The serializer recycles the buffer after it hits the transport.
#[derive(Debug)]
pub(crate) struct FinalizedFrame(pub(crate) BytesMut);

impl FinalizedFrame {
    fn header(flag: u8, id: i32) -> BytesMut {
        let mut buf = pool::frame_buffers().get();
        buf.put_u8(flag);
        buf.put_i32_le(id);
        buf
    }

    /// An empty-bodied control frame: open, open-ack, open-nack, or close.
    pub(crate) fn control(flag: u8, id: i32) -> Self {
        debug_assert!(matches!(flag, NEW_CONN | NEW_CONN_OK | NEW_CONN_FAIL | CONN_CLOSE));
        Self(Self::header(flag, id))
    }

    /// A data frame carrying one segment of a logical write.
    pub(crate) fn data(id: i32, segment: &[u8], part: bool) -> Self {
        debug_assert!(!segment.is_empty() && segment.len() <= MAXIMUM_SEGMENT_SIZE);
        let mut buf = Self::header(if part { NEW_MSG_PART } else { NEW_MSG }, id);
        buf.put_u16_le(segment.len() as u16);
        buf.put_slice(segment);
        Self(buf)
    }

    /// A credit advertisement for the peer's send window.
    pub(crate) fn credit(id: i32, remaining: u32) -> Self {
        let mut buf = Self::header(MSG_SEND_OK, id);
        buf.put_u32_le(remaining);
        Self(buf)
    }

    /// A liveness probe carrying an opaque payload, typically a timestamp.
    pub(crate) fn ping(payload: &[u8]) -> Self {
        Self::probe(PING, payload)
    }

    /// The echo reply to a ping.
    pub(crate) fn pong(payload: &[u8]) -> Self {
        Self::probe(PING_RETURN, payload)
    }

    fn probe(flag: u8, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAXIMUM_SEGMENT_SIZE);
        let mut buf = Self::header(flag, PING_ID);
        buf.put_u16_le(payload.len() as u16);
        buf.put_slice(payload);
        Self(buf)
    }

    /// Return the encode buffer to its pool.
    pub(crate) fn recycle(self) {
        pool::frame_buffers().put(self.0);
    }
}
