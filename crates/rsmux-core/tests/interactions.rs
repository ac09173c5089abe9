#![cfg(unix)]

//! Both ends of a connection driven by the engine over a socket pair.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rsmux_core::{
    Connection, ConnectionConfig, ConnectionOptions, EchoHandler, LeaseConfig, LeaseGrant,
    MuxError, Payload, PayloadSink, PayloadStream, RequestHandler, RequestInterceptor, Result,
    Role,
};
use rsmux_frame::FrameType;
use rsmux_transport::DuplexStream;

const TIMEOUT: Duration = Duration::from_secs(5);

fn connect_pair(client: ConnectionOptions, server: ConnectionOptions) -> (Connection, Connection) {
    let (left, right) = DuplexStream::pair().expect("socket pair should open");
    let server = Connection::start(left, Role::Server, server).expect("server should start");
    let client = Connection::start(right, Role::Client, client).expect("client should start");
    (client, server)
}

fn echo_server(config: ConnectionConfig) -> ConnectionOptions {
    ConnectionOptions::default()
        .with_config(config)
        .with_handler(Arc::new(EchoHandler { stream_len: 5 }))
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn request_response_round_trip() {
    let (client, _server) = connect_pair(
        ConnectionOptions::default(),
        echo_server(ConnectionConfig::default()),
    );

    let reply = client
        .requester()
        .request_response(Payload::with_metadata("ping", "trace-1"))
        .block()
        .expect("request should succeed")
        .expect("echo should answer");
    assert_eq!(reply.data().as_ref(), b"ping");
    assert_eq!(reply.metadata().expect("metadata should echo").as_ref(), b"trace-1");
    assert_eq!(client.active_streams(), (0, 0));
}

#[test]
fn request_stream_follows_demand() {
    let (client, _server) = connect_pair(
        ConnectionOptions::default(),
        echo_server(ConnectionConfig::default()),
    );

    let mut stream = client
        .requester()
        .request_stream(Payload::new("tick"))
        .subscribe()
        .expect("subscribe should succeed");
    stream.request(2);
    for _ in 0..2 {
        let payload = stream.recv().expect("element should arrive");
        assert_eq!(payload.expect("stream should not complete yet").data_utf8(), "tick");
    }

    stream.request(10);
    let rest: Vec<_> = stream
        .by_ref()
        .collect::<Result<Vec<_>>>()
        .expect("stream should complete cleanly");
    assert_eq!(rest.len(), 3);
    assert!(stream.is_done());
}

#[test]
fn channel_echoes_fragmented_payloads() {
    let config = ConnectionConfig {
        mtu: 500,
        ..ConnectionConfig::default()
    };
    let (client, _server) = connect_pair(
        ConnectionOptions::default().with_config(config.clone()),
        echo_server(config),
    );

    let first: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let (sink, mut inbound) = client
        .requester()
        .request_channel(Payload::new(first.clone()))
        .subscribe()
        .expect("subscribe should succeed");
    inbound.request(u64::MAX);

    sink.send(Payload::new(vec![1u8; 4_000]))
        .expect("second payload should send");
    sink.send(Payload::new("last")).expect("third payload should send");
    sink.complete().expect("complete should succeed");

    let echoed: Vec<_> = inbound
        .collect::<Result<Vec<_>>>()
        .expect("channel should complete cleanly");
    assert_eq!(echoed.len(), 3);
    assert_eq!(echoed[0].data().as_ref(), first.as_slice());
    assert_eq!(echoed[1].len(), 4_000);
    assert_eq!(echoed[2].data_utf8(), "last");
    assert!(wait_until(|| client.active_streams() == (0, 0)));
}

struct Recorder {
    forgotten: Mutex<mpsc::Sender<Payload>>,
    pushed: Mutex<mpsc::Sender<Bytes>>,
}

impl RequestHandler for Recorder {
    fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        let _ = self.forgotten.lock().unwrap().send(payload);
        Ok(())
    }

    fn metadata_push(&self, metadata: Bytes) {
        let _ = self.pushed.lock().unwrap().send(metadata);
    }
}

#[test]
fn fire_and_forget_and_metadata_push_reach_the_handler() {
    let (forgotten_tx, forgotten) = mpsc::channel();
    let (pushed_tx, pushed) = mpsc::channel();
    let handler = Recorder {
        forgotten: Mutex::new(forgotten_tx),
        pushed: Mutex::new(pushed_tx),
    };
    let (client, server) = connect_pair(
        ConnectionOptions::default(),
        ConnectionOptions::default().with_handler(Arc::new(handler)),
    );

    let requester = client.requester();
    requester
        .fire_and_forget(Payload::new("note"))
        .subscribe()
        .expect("fire-and-forget should send");
    requester
        .metadata_push(Bytes::from_static(b"routing-table-v2"))
        .expect("metadata push should send");

    let payload = forgotten.recv_timeout(TIMEOUT).expect("handler should see it");
    assert_eq!(payload.data_utf8(), "note");
    let metadata = pushed.recv_timeout(TIMEOUT).expect("handler should see it");
    assert_eq!(metadata.as_ref(), b"routing-table-v2");
    assert_eq!(client.active_streams(), (0, 0));
    assert_eq!(server.active_streams(), (0, 0));
}

#[test]
fn server_side_can_start_interactions() {
    let (client, server) = connect_pair(
        ConnectionOptions::default().with_handler(Arc::new(EchoHandler::default())),
        ConnectionOptions::default(),
    );

    let reply = server
        .requester()
        .request_response(Payload::new("from server"))
        .block()
        .expect("request should succeed")
        .expect("client echo should answer");
    assert_eq!(reply.data_utf8(), "from server");
    drop(client);
}

#[test]
fn leases_limit_requests() {
    let leased = ConnectionConfig {
        lease: Some(LeaseConfig {
            max_pending_requests: 0,
        }),
        ..ConnectionConfig::default()
    };
    let grant = LeaseGrant::new(2, Duration::from_secs(30));
    let server = echo_server(leased.clone()).with_lease_source(Box::new(std::iter::once(grant)));
    let (client, _server) =
        connect_pair(ConnectionOptions::default().with_config(leased), server);

    let requester = client.requester();
    assert!(wait_until(|| requester.available_lease_requests() == Some(2)));
    for _ in 0..2 {
        requester
            .request_response(Payload::new("ping"))
            .block()
            .expect("leased request should succeed");
    }
    let err = requester
        .request_response(Payload::new("ping"))
        .block()
        .expect_err("lease is used up");
    assert!(matches!(err, MuxError::MissingLease(_)), "{err}");
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl RequestInterceptor for Events {
    fn on_start(&self, stream_id: u32, frame_type: FrameType, _metadata: Option<&Bytes>) {
        self.0.lock().unwrap().push(format!("start {stream_id} {frame_type}"));
    }

    fn on_terminate(&self, stream_id: u32, frame_type: FrameType, error: Option<&MuxError>) {
        let outcome = if error.is_some() { "error" } else { "ok" };
        self.0
            .lock()
            .unwrap()
            .push(format!("terminate {stream_id} {frame_type} {outcome}"));
    }

    fn on_cancel(&self, stream_id: u32, frame_type: FrameType) {
        self.0.lock().unwrap().push(format!("cancel {stream_id} {frame_type}"));
    }
}

#[test]
fn interceptors_observe_both_sides() {
    let client_events = Arc::new(Events::default());
    let server_events = Arc::new(Events::default());
    let (client, _server) = connect_pair(
        ConnectionOptions::default().with_interceptor(client_events.clone()),
        echo_server(ConnectionConfig::default()).with_interceptor(server_events.clone()),
    );

    client
        .requester()
        .request_response(Payload::new("ping"))
        .block()
        .expect("request should succeed");

    let rr = FrameType::RequestResponse;
    let expected = vec![format!("start 1 {rr}"), format!("terminate 1 {rr} ok")];
    assert!(wait_until(|| *server_events.0.lock().unwrap() == expected));
    assert!(wait_until(|| *client_events.0.lock().unwrap() == expected));
}

struct Silent;

impl RequestHandler for Silent {
    fn request_stream(&self, _payload: Payload, sink: &PayloadSink) -> Result<()> {
        while !sink.is_closed() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn request_channel(
        &self,
        _first: Payload,
        mut inbound: PayloadStream,
        _sink: &PayloadSink,
    ) -> Result<()> {
        inbound.request(1);
        while inbound.recv()?.is_some() {}
        Ok(())
    }
}

#[test]
fn closing_fails_active_interactions() {
    let (client, server) = connect_pair(
        ConnectionOptions::default(),
        ConnectionOptions::default().with_handler(Arc::new(Silent)),
    );

    let mut stream = client
        .requester()
        .request_stream(Payload::new("wait"))
        .subscribe()
        .expect("subscribe should succeed");
    stream.request(1);
    assert!(wait_until(|| server.active_streams() == (0, 1)));

    client.close();
    let err = stream.recv().expect_err("stream should fail on close");
    assert!(matches!(err, MuxError::ConnectionClosed(_)), "{err}");

    let reason = server.on_close();
    assert!(reason.contains("peer closed"), "{reason}");
    assert!(wait_until(|| server.active_streams() == (0, 0)));
    assert!(client
        .requester()
        .request_response(Payload::new("late"))
        .block()
        .is_err());
}

#[test]
fn requester_cancel_reaches_responder() {
    let (client, server) = connect_pair(
        ConnectionOptions::default(),
        ConnectionOptions::default().with_handler(Arc::new(Silent)),
    );

    let (_sink, mut inbound) = client
        .requester()
        .request_channel(Payload::new("open"))
        .subscribe()
        .expect("subscribe should succeed");
    inbound.request(1);
    assert!(wait_until(|| server.active_streams() == (0, 1)));

    drop(inbound);
    assert!(wait_until(|| server.active_streams() == (0, 0)));
}
