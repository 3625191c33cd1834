//! End-to-end multiplexer behavior over in-memory and TCP transports.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use braid_mux::{Error, Mux, MuxConfig, MuxStream, OptionalDuration, Role};
use rand::RngCore;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

#[ctor::ctor]
fn log_init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

fn pair() -> (Mux, Mux) {
    pair_with(MuxConfig::default())
}

fn pair_with(config: MuxConfig) -> (Mux, Mux) {
    let (a, b) = tokio::io::duplex(65536);
    (
        Mux::with_config(a, Role::Tcp, config),
        Mux::with_config(b, Role::Tcp, config),
    )
}

async fn open_pair(ma: &Mux, mb: &Mux) -> (MuxStream, MuxStream) {
    let (dialed, accepted) = tokio::join!(ma.new_stream(), mb.accept());
    (dialed.expect("dial"), accepted.expect("accept"))
}

async fn read_full<R: AsyncRead + Unpin>(stream: &mut R, want: usize) -> Vec<u8> {
    let mut buf = vec![0u8; want];
    let mut n = 0;
    while n < want {
        let got = stream.read(&mut buf[n..]).await.expect("read");
        assert!(got > 0, "unexpected end of stream after {n} bytes");
        n += got;
    }
    buf
}

async fn read_to_end<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let got = stream.read(&mut buf).await.expect("read");
        if got == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..got]);
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    sa.write_all(b"hello").await.unwrap();
    let got = read_full(&mut sb, 5).await;
    assert_eq!(&got, b"hello");
    sb.write_all(&got).await.unwrap();
    let back = read_full(&mut sa, 5).await;
    assert_eq!(&back, b"hello");
    sa.close();
    sb.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_single_write_is_segmented_and_lossless() {
    const TOTAL: usize = 16 * 1024 * 1024;
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    let writer = tokio::spawn(async move {
        let data = vec![0u8; TOTAL];
        sa.write_all(&data).await.expect("write");
        sa.close();
    });
    let got = read_to_end(&mut sb).await;
    writer.await.unwrap();
    assert_eq!(got.len(), TOTAL);
    assert!(got.iter().all(|&b| b == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_payload_arrives_in_order() {
    const TOTAL: usize = 1024 * 1024 + 137;
    let mut data = vec![0u8; TOTAL];
    rand::rng().fill_bytes(&mut data);
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    let expected = data.clone();
    let writer = tokio::spawn(async move {
        // Several writes of awkward sizes; the far side must see the exact
        // concatenation.
        for chunk in data.chunks(100_003) {
            sa.write_all(chunk).await.expect("write");
        }
        sa.close();
    });
    let got = read_to_end(&mut sb).await;
    writer.await.unwrap();
    assert_eq!(got, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_halves_run_full_duplex() {
    const TOTAL: usize = 256 * 1024;
    let (ma, mb) = pair();
    let (sa, sb) = open_pair(&ma, &mb).await;
    // Reading and writing the same stream from different tasks at once;
    // both directions exceed the receive window, so neither finishes
    // unless the opposite half keeps draining concurrently.
    let (mut ra, mut wa) = tokio::io::split(sa);
    let (mut rb, mut wb) = tokio::io::split(sb);
    let send_a = tokio::spawn(async move {
        wa.write_all(&vec![0xA5u8; TOTAL]).await.expect("write");
    });
    let send_b = tokio::spawn(async move {
        wb.write_all(&vec![0x5Au8; TOTAL]).await.expect("write");
    });
    let recv_a = tokio::spawn(async move {
        let got = read_full(&mut ra, TOTAL).await;
        assert!(got.iter().all(|&b| b == 0x5A));
    });
    let recv_b = tokio::spawn(async move {
        let got = read_full(&mut rb, TOTAL).await;
        assert!(got.iter().all(|&b| b == 0xA5));
    });
    send_a.await.unwrap();
    send_b.await.unwrap();
    recv_a.await.unwrap();
    recv_b.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writer_stalls_until_the_reader_drains() {
    const TOTAL: usize = 60_000;
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    let writer = tokio::spawn(async move {
        let data = vec![7u8; TOTAL];
        sa.write_all(&data).await.expect("write");
        TOTAL
    });
    // The receive window starts at ten segments; a 60 kB write cannot
    // finish until the reader frees room.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished(), "writer should be blocked on credit");
    let got = read_full(&mut sb, TOTAL).await;
    assert!(got.iter().all(|&b| b == 7));
    assert_eq!(writer.await.unwrap(), TOTAL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn a_thousand_streams_exchange_data() {
    const STREAMS: usize = 1000;
    const CHUNK: usize = 1024;
    // Room for the whole dial burst even if the accept loop lags.
    let config = MuxConfig {
        accept_backlog: 1024,
        ..MuxConfig::default()
    };
    let (ma, mb) = pair_with(config);
    let acceptor = tokio::spawn(async move {
        let mut handlers = Vec::new();
        for _ in 0..STREAMS {
            let mut stream = mb.accept().await.expect("accept");
            handlers.push(tokio::spawn(async move {
                let got = read_full(&mut stream, CHUNK).await;
                stream.write_all(&got).await.expect("echo");
                // Wait for the peer's close so nothing is torn down early.
                let mut rest = [0u8; 1];
                assert_eq!(stream.read(&mut rest).await.expect("drain"), 0);
                stream.close();
            }));
        }
        for handler in handlers {
            handler.await.unwrap();
        }
        mb
    });
    let mut dialers = Vec::new();
    for i in 0..STREAMS {
        let mut stream = ma.new_stream().await.expect("dial");
        dialers.push(tokio::spawn(async move {
            let payload = vec![(i % 251) as u8; CHUNK];
            stream.write_all(&payload).await.expect("write");
            let got = read_full(&mut stream, CHUNK).await;
            assert_eq!(got, payload);
            stream.close();
        }));
    }
    for dialer in dialers {
        dialer.await.unwrap();
    }
    let mb = acceptor.await.unwrap();
    // Close notifications settle shortly after the last endpoint goes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ma.active_streams(), 0);
    assert_eq!(mb.active_streams(), 0);
}

#[tokio::test]
async fn read_deadline_fires_and_clears() {
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    sa.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let before = Instant::now();
    let mut buf = [0u8; 8];
    let err = sa.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut, "got {err}");
    let waited = before.elapsed();
    assert!(
        waited >= Duration::from_millis(40) && waited < Duration::from_millis(400),
        "timed out after {waited:?}"
    );
    // Clearing the deadline makes reads block again, and data still flows.
    sa.set_read_deadline(None);
    sb.write_all(b"late").await.unwrap();
    assert_eq!(&read_full(&mut sa, 4).await, b"late");
}

#[tokio::test]
async fn past_read_deadline_times_out_immediately() {
    let (ma, mb) = pair();
    let (mut sa, _sb) = open_pair(&ma, &mb).await;
    sa.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
    let before = Instant::now();
    let mut buf = [0u8; 8];
    let err = sa.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(before.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn remote_close_drains_then_eof() {
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    sa.write_all(b"bye").await.unwrap();
    sa.close();
    // All three bytes arrive ahead of the close.
    assert_eq!(&read_full(&mut sb, 3).await, b"bye");
    let mut buf = [0u8; 8];
    assert_eq!(sb.read(&mut buf).await.unwrap(), 0);
    let err = sb.write_all(b"nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenPipe, "got {err}");
}

#[tokio::test]
async fn close_is_idempotent_and_terminal() {
    let (ma, mb) = pair();
    let (mut sa, _sb) = open_pair(&ma, &mb).await;
    sa.close();
    sa.close();
    let mut buf = [0u8; 8];
    assert_eq!(sa.read(&mut buf).await.unwrap_err().kind(), ErrorKind::BrokenPipe);
    assert_eq!(
        sa.write_all(b"x").await.unwrap_err().kind(),
        ErrorKind::BrokenPipe
    );
}

#[tokio::test]
async fn empty_reads_and_writes_return_at_once() {
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    assert_eq!(sa.write(b"").await.unwrap(), 0);
    let mut empty = [0u8; 0];
    assert_eq!(sa.read(&mut empty).await.unwrap(), 0);
    // The empty write emitted no frame; real data still lines up.
    sa.write_all(b"ping").await.unwrap();
    assert_eq!(&read_full(&mut sb, 4).await, b"ping");
}

#[tokio::test]
async fn accept_backlog_overflow_refuses_the_dial() {
    let config = MuxConfig {
        accept_backlog: 1,
        ..MuxConfig::default()
    };
    let (ma, _mb) = pair_with(config);
    // Nobody accepts: the first open parks in the backlog, the second is
    // refused by the peer.
    let _parked = ma.new_stream().await.expect("first dial");
    let err = ma.new_stream().await.unwrap_err();
    assert!(matches!(err, Error::Capacity), "got {err}");
}

#[tokio::test]
async fn mux_close_fans_out_to_streams_and_accept() {
    let (ma, mb) = pair();
    let (mut sa, _sb) = open_pair(&ma, &mb).await;
    let pending_accept = tokio::spawn(async move {
        let err = mb.accept().await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        mb
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ma.close();
    assert!(ma.is_closed());
    // The peer notices the dead transport and cascades.
    let mb = pending_accept.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mb.is_closed());
    let mut buf = [0u8; 8];
    assert_eq!(sa.read(&mut buf).await.unwrap(), 0);
    assert_eq!(
        sa.write_all(b"x").await.unwrap_err().kind(),
        ErrorKind::BrokenPipe
    );
    assert!(matches!(ma.new_stream().await, Err(Error::Closed)));
}

#[tokio::test]
async fn silent_peer_trips_the_keepalive() {
    let config = MuxConfig {
        keepalive_interval: OptionalDuration::new(Duration::from_millis(100)),
        ping_timeout_intervals: 3,
        ..MuxConfig::default()
    };
    let (a, b) = tokio::io::duplex(65536);
    let ma = Mux::with_config(a, Role::Tcp, config);
    // The raw far end stays open but never answers anything.
    let _silent = b;
    let pending_accept = tokio::spawn(async move {
        let err = ma.accept().await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        ma
    });
    let ma = tokio::time::timeout(Duration::from_secs(2), pending_accept)
        .await
        .expect("keepalive should have shut the mux down")
        .unwrap();
    assert!(ma.is_closed());
}

#[tokio::test]
async fn pings_feed_the_latency_estimate() {
    let config = MuxConfig {
        keepalive_interval: OptionalDuration::new(Duration::from_millis(50)),
        ..MuxConfig::default()
    };
    let (ma, _mb) = pair_with(config);
    tokio::time::sleep(Duration::from_millis(300)).await;
    // Pongs flow on a healthy link, so the mux stays up and the latency
    // figure becomes a real (tiny) number.
    assert!(!ma.is_closed());
    assert!(ma.latency() > 0.0);
    assert!(ma.read_bandwidth() >= 100.0);
}

#[tokio::test]
async fn works_over_real_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
    let client = client.expect("connect");
    let (server, _) = server.expect("accept");
    let ma = Mux::new(client, Role::Tcp);
    let mb = Mux::new(server, Role::Tcp);
    assert!(ma.local_addr().is_some());
    assert_eq!(ma.peer_addr(), Some(addr));
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    assert_eq!(sa.peer_addr(), Some(addr));
    sa.write_all(b"over tcp").await.unwrap();
    assert_eq!(&read_full(&mut sb, 8).await, b"over tcp");
    sa.close();
    sb.close();
    ma.close();
    mb.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bidirectional_traffic_on_one_stream() {
    const ROUNDS: usize = 32;
    const CHUNK: usize = 8 * 1024;
    let (ma, mb) = pair();
    let (mut sa, mut sb) = open_pair(&ma, &mb).await;
    // Alternate writes and reads so neither side outruns the other's
    // receive window.
    let left = tokio::spawn(async move {
        let data = vec![3u8; CHUNK];
        for _ in 0..ROUNDS {
            sa.write_all(&data).await.expect("write");
            let got = read_full(&mut sa, CHUNK).await;
            assert!(got.iter().all(|&b| b == 4));
        }
        sa.close();
    });
    let right = tokio::spawn(async move {
        let data = vec![4u8; CHUNK];
        for _ in 0..ROUNDS {
            sb.write_all(&data).await.expect("write");
            let got = read_full(&mut sb, CHUNK).await;
            assert!(got.iter().all(|&b| b == 3));
        }
        sb.close();
    });
    left.await.unwrap();
    right.await.unwrap();
}

#[tokio::test]
async fn dropping_a_stream_closes_it_for_the_peer() {
    let (ma, mb) = pair();
    let (sa, mut sb) = open_pair(&ma, &mb).await;
    drop(sa);
    let mut buf = [0u8; 8];
    assert_eq!(sb.read(&mut buf).await.unwrap(), 0);
}
