//! Shared harness for integration tests: two endpoints in one process,
//! connected over the UDP transport on loopback.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fabrpc::{Nexus, Rpc, RpcConfig, SmEvent, UdpTransport};

pub const SERVER_RPC_ID: u8 = 0;
pub const CLIENT_RPC_ID: u8 = 1;

pub type SmEvents = Arc<Mutex<Vec<(u16, SmEvent, Option<String>)>>>;

pub struct Pair {
    pub client: Rpc<UdpTransport>,
    pub server: Rpc<UdpTransport>,
    pub client_nexus: Nexus,
    pub server_nexus: Nexus,
    pub client_events: SmEvents,
    pub server_events: SmEvents,
}

fn recording_handler(events: &SmEvents) -> fabrpc::SmHandler {
    let events = events.clone();
    Box::new(move |session, event, err| {
        events
            .lock()
            .unwrap()
            .push((session, event, err.map(|e| e.to_string())));
    })
}

/// Build two endpoints. `register` runs against both nexuses before the
/// endpoints snapshot the handler registry.
pub fn pair(
    client_cfg: RpcConfig,
    server_cfg: RpcConfig,
    mtu: usize,
    register: impl Fn(&Nexus),
) -> Pair {
    let client_nexus = Nexus::new("127.0.0.1:0").unwrap();
    let server_nexus = Nexus::new("127.0.0.1:0").unwrap();
    register(&client_nexus);
    register(&server_nexus);

    let client_events: SmEvents = Arc::new(Mutex::new(Vec::new()));
    let server_events: SmEvents = Arc::new(Mutex::new(Vec::new()));

    let client = Rpc::new(
        &client_nexus,
        CLIENT_RPC_ID,
        UdpTransport::bind_with_mtu("127.0.0.1:0", mtu).unwrap(),
        client_cfg,
        recording_handler(&client_events),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        SERVER_RPC_ID,
        UdpTransport::bind_with_mtu("127.0.0.1:0", mtu).unwrap(),
        server_cfg,
        recording_handler(&server_events),
    )
    .unwrap();

    Pair {
        client,
        server,
        client_nexus,
        server_nexus,
        client_events,
        server_events,
    }
}

impl Pair {
    /// Connect a client session to the server and wait for the handshake.
    pub fn connect(&mut self) -> u16 {
        let server_uri = self.server_nexus.local_uri().to_string();
        let session = self
            .client
            .create_session(&server_uri, SERVER_RPC_ID)
            .unwrap();
        let ok = drive(self, 5_000, |p| {
            p.client.session_state(session) == Some(fabrpc::SessionState::Connected)
        });
        assert!(ok, "session did not connect");
        session
    }
}

/// Step both event loops until `pred` holds or `timeout_ms` passes.
pub fn drive(pair: &mut Pair, timeout_ms: u64, mut pred: impl FnMut(&mut Pair) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let _ = pair.client.run_event_loop_once();
        let _ = pair.server.run_event_loop_once();
        if pred(pair) {
            return true;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    false
}

/// Step one endpoint alone (peer-death scenarios).
pub fn drive_one(
    rpc: &mut Rpc<UdpTransport>,
    timeout_ms: u64,
    mut pred: impl FnMut(&mut Rpc<UdpTransport>) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let _ = rpc.run_event_loop_once();
        if pred(rpc) {
            return true;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    false
}
