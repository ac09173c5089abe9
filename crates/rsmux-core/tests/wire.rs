#![cfg(unix)]

//! One engine-driven side against a hand-driven peer that reads and writes
//! raw frames, so the exact wire traffic can be checked.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rsmux_core::{
    Connection, ConnectionConfig, ConnectionOptions, EchoHandler, LeaseConfig, MuxError, Payload,
    Role,
};
use rsmux_frame::frame_type::{FLAG_COMPLETE, FLAG_METADATA, FLAG_NEXT};
use rsmux_frame::{error_code, Frame, FrameError, FrameReader, FrameType, FrameWriter};
use rsmux_transport::DuplexStream;

struct RawPeer {
    reader: FrameReader<DuplexStream>,
    writer: FrameWriter<DuplexStream>,
    raw: DuplexStream,
}

impl RawPeer {
    fn recv(&mut self) -> Frame {
        self.reader.read_frame().expect("peer should read a frame")
    }

    fn send(&mut self, frame: &Frame) {
        self.writer.write_frame(frame).expect("peer should write a frame");
    }

    /// A frame whose metadata length claims 255 bytes but only two follow.
    fn send_short_metadata(&mut self, stream_id: u32, frame_type: FrameType, flags: u16) {
        let type_and_flags = (u16::from(frame_type.encoded_type()) << 10) | FLAG_METADATA | flags;
        let mut raw = vec![0x00, 0x00, 11];
        raw.extend_from_slice(&stream_id.to_be_bytes());
        raw.extend_from_slice(&type_and_flags.to_be_bytes());
        raw.extend_from_slice(&[0x00, 0x00, 0xFF, b'h', b'i']);
        self.raw.write_all(&raw).expect("peer should write raw bytes");
    }
}

fn start(role: Role, options: ConnectionOptions) -> (Connection, RawPeer) {
    let (local, remote) = DuplexStream::pair().expect("socket pair should open");
    remote
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout should apply");
    let peer = RawPeer {
        reader: FrameReader::new(remote.try_clone().expect("stream should clone")),
        raw: remote.try_clone().expect("stream should clone"),
        writer: FrameWriter::new(remote),
    };
    let connection = Connection::start(local, role, options).expect("connection should start");
    (connection, peer)
}

fn client(config: ConnectionConfig) -> (Connection, RawPeer) {
    start(Role::Client, ConnectionOptions::default().with_config(config))
}

fn payload(stream_id: u32, frame_type: FrameType, data: &[u8]) -> Frame {
    Frame::payload_frame(stream_id, frame_type, 0, 0, None, data).expect("frame should encode")
}

#[test]
fn request_response_is_one_frame_on_stream_one() {
    let config = ConnectionConfig {
        max_frame_length: 1000,
        ..ConnectionConfig::default()
    };
    let (connection, mut peer) = client(config);

    let request = connection
        .requester()
        .request_response(Payload::new(vec![7u8; 10]));
    let waiter = thread::spawn(move || request.block());

    let frame = peer.recv();
    assert_eq!(frame.stream_id(), 1);
    assert_eq!(frame.frame_type(), FrameType::RequestResponse);
    assert!(!frame.has_follows());
    assert_eq!(frame.data().as_ref(), &[7u8; 10]);

    peer.send(&payload(1, FrameType::NextComplete, b"pong"));
    let reply = waiter
        .join()
        .expect("waiter should finish")
        .expect("request should succeed")
        .expect("reply should carry a payload");
    assert_eq!(reply.data().as_ref(), b"pong");
    assert_eq!(connection.active_streams(), (0, 0));
}

#[test]
fn large_channel_request_is_fragmented() {
    let config = ConnectionConfig {
        mtu: 500,
        ..ConnectionConfig::default()
    };
    let (connection, mut peer) = client(config);

    let (_sink, mut inbound) = connection
        .requester()
        .request_channel(Payload::new(vec![3u8; 200_000]))
        .subscribe()
        .expect("subscribe should succeed");
    inbound.request(1);

    let first = peer.recv();
    assert_eq!(first.frame_type(), FrameType::RequestChannel);
    assert_eq!(first.request_n(), Some(1));
    assert!(first.has_follows());
    assert!(first.len() + 3 <= 500);

    let mut total = first.data().len();
    let mut fragments = 1;
    loop {
        let frame = peer.recv();
        assert_eq!(frame.stream_id(), 1);
        assert_eq!(frame.frame_type(), FrameType::Next);
        assert!(frame.len() + 3 <= 500);
        total += frame.data().len();
        fragments += 1;
        if !frame.has_follows() {
            break;
        }
    }
    assert_eq!(total, 200_000);
    assert!(fragments > 400);
}

#[test]
fn stream_overflow_cancels_exactly_once() {
    let (connection, mut peer) = client(ConnectionConfig::default());
    let mut stream = connection
        .requester()
        .request_stream(Payload::new("one please"))
        .subscribe()
        .expect("subscribe should succeed");
    stream.request(1);

    let request = peer.recv();
    assert_eq!(request.frame_type(), FrameType::RequestStream);
    assert_eq!(request.request_n(), Some(1));

    peer.send(&payload(1, FrameType::Next, b"a"));
    peer.send(&payload(1, FrameType::Next, b"b"));
    peer.send(&payload(1, FrameType::Next, b"c"));

    let first = stream.recv().expect("first element is within demand");
    assert_eq!(first.expect("element").data_utf8(), "a");
    let err = stream.recv().expect_err("second element overflows");
    assert!(
        matches!(err, MuxError::Overflow { requested: 1, produced: 2 }),
        "{err}"
    );

    let cancel = peer.recv();
    assert_eq!(cancel.frame_type(), FrameType::Cancel);
    assert_eq!(cancel.stream_id(), 1);

    // Anything after the CANCEL must be the keepalive answer.
    peer.send(&Frame::keepalive(true, 0, b"ping"));
    let next = peer.recv();
    assert_eq!(next.frame_type(), FrameType::KeepAlive);
    assert!(!connection.is_closed());
}

#[test]
fn queued_requests_go_out_in_order_when_a_lease_arrives() {
    let config = ConnectionConfig {
        lease: Some(LeaseConfig {
            max_pending_requests: 2,
        }),
        ..ConnectionConfig::default()
    };
    let (connection, mut peer) = client(config);
    let requester = connection.requester();

    let mut queued = Vec::new();
    for name in ["a", "b"] {
        let mut stream = requester
            .request_stream(Payload::new(name))
            .subscribe()
            .expect("subscribe should succeed");
        stream.request(4);
        queued.push(stream);
    }
    let mut rejected = requester
        .request_stream(Payload::new("c"))
        .subscribe()
        .expect("subscribe should succeed");
    rejected.request(4);
    let err = rejected.recv().expect_err("queue is full");
    assert!(matches!(err, MuxError::MissingLease(_)), "{err}");

    peer.send(&Frame::lease(Duration::from_secs(30), 2, None));
    let first = peer.recv();
    let second = peer.recv();
    assert_eq!((first.stream_id(), first.data().as_ref()), (1, &b"a"[..]));
    assert_eq!((second.stream_id(), second.data().as_ref()), (3, &b"b"[..]));
    assert_eq!(first.request_n(), Some(4));
}

#[test]
fn responder_without_lease_rejects() {
    let config = ConnectionConfig {
        lease: Some(LeaseConfig::default()),
        ..ConnectionConfig::default()
    };
    let options = ConnectionOptions::default()
        .with_config(config)
        .with_handler(Arc::new(EchoHandler::default()));
    let (_connection, mut peer) = start(Role::Server, options);

    peer.send(&payload(1, FrameType::RequestResponse, b"hello"));
    let frame = peer.recv();
    assert_eq!(frame.stream_id(), 1);
    assert_eq!(frame.error_code(), Some(error_code::REJECTED));
}

#[test]
fn responder_answers_fragmented_request() {
    let options = ConnectionOptions::default().with_handler(Arc::new(EchoHandler::default()));
    let (_connection, mut peer) = start(Role::Server, options);

    let frames: Vec<_> = rsmux_frame::Fragmenter::new(
        1,
        FrameType::RequestResponse,
        0,
        false,
        128,
        None,
        vec![5u8; 1_000].into(),
    )
    .expect("fragmenter should accept the payload")
    .collect();
    assert!(frames.len() > 1);
    for frame in &frames {
        peer.send(frame);
    }

    let reply = peer.recv();
    assert_eq!(reply.stream_id(), 1);
    assert_eq!(reply.frame_type(), FrameType::NextComplete);
    assert_eq!(reply.data().len(), 1_000);
}

#[test]
fn request_channel_with_complete_flag_half_closes() {
    let options = ConnectionOptions::default().with_handler(Arc::new(EchoHandler::default()));
    let (connection, mut peer) = start(Role::Server, options);

    let open = Frame::payload_frame(1, FrameType::RequestChannel, FLAG_COMPLETE, 2, None, b"x")
        .expect("frame should encode");
    peer.send(&open);

    let echoed = peer.recv();
    assert_eq!(echoed.frame_type(), FrameType::Next);
    assert_eq!(echoed.data().as_ref(), b"x");
    let done = peer.recv();
    assert_eq!(done.frame_type(), FrameType::Complete);
    assert_eq!(done.stream_id(), 1);

    peer.send(&Frame::keepalive(true, 0, b""));
    assert_eq!(peer.recv().frame_type(), FrameType::KeepAlive);
    assert_eq!(connection.active_streams(), (0, 0));
}

#[test]
fn cancel_after_request_is_sent_once() {
    let (connection, mut peer) = client(ConnectionConfig::default());
    let mut subscription = connection
        .requester()
        .request_response(Payload::new("slow"))
        .subscribe()
        .expect("subscribe should succeed");
    assert!(subscription.recv_timeout(Duration::from_millis(10)).is_err());

    assert_eq!(peer.recv().frame_type(), FrameType::RequestResponse);
    subscription.cancel();
    let cancel = peer.recv();
    assert_eq!(cancel.frame_type(), FrameType::Cancel);
    assert_eq!(cancel.stream_id(), 1);

    // A late answer for the cancelled stream is dropped.
    peer.send(&payload(1, FrameType::NextComplete, b"too late"));
    drop(subscription);
    peer.send(&Frame::keepalive(true, 0, b""));
    assert_eq!(peer.recv().frame_type(), FrameType::KeepAlive);
    assert!(!connection.is_closed());
}

#[test]
fn connection_error_from_peer_closes_everything() {
    let (connection, mut peer) = client(ConnectionConfig::default());
    let mut stream = connection
        .requester()
        .request_stream(Payload::new("forever"))
        .subscribe()
        .expect("subscribe should succeed");
    stream.request(1);
    assert_eq!(peer.recv().frame_type(), FrameType::RequestStream);

    peer.send(&Frame::error(0, error_code::CONNECTION_CLOSE, "going away"));
    let reason = connection.on_close();
    assert!(reason.contains("going away"), "{reason}");
    assert!(matches!(
        stream.recv(),
        Err(MuxError::ConnectionClosed(_))
    ));
}

#[test]
fn malformed_request_fails_only_its_stream() {
    let options = ConnectionOptions::default().with_handler(Arc::new(EchoHandler::default()));
    let (connection, mut peer) = start(Role::Server, options);

    peer.send_short_metadata(1, FrameType::RequestResponse, 0);
    let rejected = peer.recv();
    assert_eq!(rejected.stream_id(), 1);
    assert_eq!(rejected.frame_type(), FrameType::Error);
    assert_eq!(rejected.error_code(), Some(error_code::INVALID));

    peer.send(&payload(3, FrameType::RequestResponse, b"still here"));
    let reply = peer.recv();
    assert_eq!(reply.stream_id(), 3);
    assert_eq!(reply.frame_type(), FrameType::NextComplete);
    assert_eq!(reply.data().as_ref(), b"still here");

    peer.send(&Frame::keepalive(true, 0, b""));
    assert_eq!(peer.recv().frame_type(), FrameType::KeepAlive);
    assert!(!connection.is_closed());
    assert_eq!(connection.active_streams(), (0, 0));
}

#[test]
fn malformed_response_cancels_the_requesting_stream() {
    let (connection, mut peer) = client(ConnectionConfig::default());
    let mut stream = connection
        .requester()
        .request_stream(Payload::new("numbers"))
        .subscribe()
        .expect("subscribe should succeed");
    stream.request(2);
    assert_eq!(peer.recv().frame_type(), FrameType::RequestStream);

    peer.send_short_metadata(1, FrameType::Next, FLAG_NEXT);
    let cancel = peer.recv();
    assert_eq!(cancel.frame_type(), FrameType::Cancel);
    assert_eq!(cancel.stream_id(), 1);
    assert!(matches!(
        stream.recv(),
        Err(MuxError::Frame(FrameError::MalformedBody { stream_id: 1, .. }))
    ));

    peer.send(&Frame::keepalive(true, 0, b""));
    assert_eq!(peer.recv().frame_type(), FrameType::KeepAlive);
    assert!(!connection.is_closed());
    assert_eq!(connection.active_streams(), (0, 0));
}
