//! Process-wide endpoint registry and session-management plane.
//!
//! One Nexus per process: it owns the session-management UDP socket, routes
//! inbound SM datagrams to the right endpoint's inbox, and holds the request
//! handler registry. Handlers are registered before endpoints are created;
//! each endpoint snapshots the registry at construction.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::sm::{SmErrCode, SmPkt, SmPktType, SM_PKT_SIZE};

/// SM inbox depth per endpoint.
const SM_INBOX_CAPACITY: usize = 64;

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Inline on the dispatch thread. Must not block.
    Foreground,
    /// On a background worker thread.
    Background,
}

/// Server-side context for one request.
///
/// Handlers read the request through [`req_data`](ReqHandle::req_data),
/// write the reply into [`resp_buf`](ReqHandle::resp_buf) and record its
/// length with [`set_resp_size`](ReqHandle::set_resp_size); the runtime
/// enqueues the response when the handler returns (foreground) or when the
/// worker's completion record is drained (background).
pub struct ReqHandle {
    pub(crate) session_num: u16,
    pub(crate) slot_idx: u8,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req_msgbuf: Option<MsgBuffer>,
    pub(crate) resp_msgbuf: Option<MsgBuffer>,
    pub(crate) resp_size: usize,
}

impl ReqHandle {
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The reassembled request payload.
    #[inline]
    pub fn req_data(&self) -> &[u8] {
        self.req_msgbuf.as_ref().map_or(&[], |b| b.data())
    }

    /// The writable response buffer, full capacity.
    #[inline]
    pub fn resp_buf(&mut self) -> &mut [u8] {
        self.resp_msgbuf.as_mut().map_or(&mut [], |b| b.data_mut())
    }

    /// Record how many response bytes the handler produced.
    pub fn set_resp_size(&mut self, n: usize) {
        let cap = self.resp_msgbuf.as_ref().map_or(0, |b| b.data_size());
        assert!(n <= cap, "response of {n} bytes exceeds buffer of {cap}");
        self.resp_size = n;
    }
}

pub(crate) type ReqHandlerFn = dyn Fn(&mut ReqHandle) + Send + Sync;

#[derive(Clone)]
pub(crate) struct ReqHandlerEntry {
    pub func: Arc<ReqHandlerFn>,
    pub kind: HandlerKind,
}

pub(crate) struct NexusInner {
    socket: UdpSocket,
    local_uri: String,
    /// SM inbox producers, one per registered endpoint.
    hooks: Mutex<HashMap<u8, spsc_ring::Producer<SmPkt>>>,
    handlers: Mutex<Vec<Option<ReqHandlerEntry>>>,
    resolve_cache: Mutex<HashMap<String, SocketAddr>>,
    shutdown: AtomicBool,
}

impl NexusInner {
    /// Send an SM datagram, caching hostname resolution per peer.
    pub(crate) fn sm_send(&self, dest_uri: &str, pkt: &SmPkt) -> Result<()> {
        let addr = {
            let mut cache = self.resolve_cache.lock().unwrap();
            match cache.get(dest_uri) {
                Some(a) => *a,
                None => {
                    let addr = dest_uri
                        .to_socket_addrs()?
                        .next()
                        .ok_or(Error::InvalidConfig("unresolvable peer uri"))?;
                    cache.insert(dest_uri.to_string(), addr);
                    addr
                }
            }
        };
        self.socket.send_to(&pkt.to_bytes(), addr)?;
        Ok(())
    }

    pub(crate) fn local_uri(&self) -> &str {
        &self.local_uri
    }

    /// Endpoint teardown path; the `Nexus` front door has the same method
    /// for application use.
    pub(crate) fn unregister(&self, rpc_id: u8) {
        self.hooks.lock().unwrap().remove(&rpc_id);
    }

    fn route(&self, pkt: SmPkt) {
        let dest = pkt.dest_rpc_id();
        let undelivered = {
            let mut hooks = self.hooks.lock().unwrap();
            match hooks.get_mut(&dest) {
                Some(inbox) => {
                    if let Err(e) = inbox.try_send(pkt) {
                        log::warn!("sm inbox for rpc {dest} rejected a packet: {e}");
                    }
                    None
                }
                None => Some(pkt),
            }
        };

        let Some(pkt) = undelivered else { return };
        if pkt.pkt_type == SmPktType::ConnectReq {
            // Tell the client now rather than letting it retry into the
            // void.
            let mut resp = pkt.clone();
            resp.pkt_type = SmPktType::ConnectResp;
            resp.err = SmErrCode::InvalidRpcId;
            if let Err(e) = self.sm_send(pkt.reply_uri(), &resp) {
                log::warn!("sm reject reply failed: {e}");
            }
        } else {
            log::debug!("sm packet for unknown rpc {dest} dropped");
        }
    }
}

/// Process-wide registry of endpoints.
pub struct Nexus {
    inner: Arc<NexusInner>,
    listener: Option<JoinHandle<()>>,
}

impl Nexus {
    /// Bind the session-management socket and start the listener thread.
    ///
    /// `uri` is "host:port"; port 0 picks an ephemeral port, and the
    /// advertised URI is taken from the bound address either way.
    pub fn new(uri: &str) -> Result<Nexus> {
        let socket = UdpSocket::bind(uri)?;
        socket.set_read_timeout(Some(Duration::from_millis(25)))?;
        let local_uri = socket.local_addr()?.to_string();

        let inner = Arc::new(NexusInner {
            socket,
            local_uri,
            hooks: Mutex::new(HashMap::new()),
            handlers: Mutex::new(vec![None; 256]),
            resolve_cache: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let listener_inner = inner.clone();
        let listener = std::thread::Builder::new()
            .name("fabrpc-sm".to_string())
            .spawn(move || sm_listener(listener_inner))
            .map_err(Error::Io)?;

        Ok(Nexus {
            inner,
            listener: Some(listener),
        })
    }

    /// The URI peers use to reach this process's SM plane.
    pub fn local_uri(&self) -> &str {
        self.inner.local_uri()
    }

    /// Register a typed request handler. Must happen before endpoints that
    /// should see it are created, since endpoints snapshot the registry.
    pub fn register_req_handler<F>(&self, req_type: u8, kind: HandlerKind, f: F)
    where
        F: Fn(&mut ReqHandle) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers[req_type as usize] = Some(ReqHandlerEntry {
            func: Arc::new(f),
            kind,
        });
    }

    pub(crate) fn handler_snapshot(&self) -> Vec<Option<ReqHandlerEntry>> {
        self.inner.handlers.lock().unwrap().clone()
    }

    pub(crate) fn register_rpc(&self, rpc_id: u8) -> Result<spsc_ring::Consumer<SmPkt>> {
        let mut hooks = self.inner.hooks.lock().unwrap();
        if hooks.contains_key(&rpc_id) {
            return Err(Error::InvalidConfig("rpc id already registered"));
        }
        let (tx, rx) = spsc_ring::channel(SM_INBOX_CAPACITY);
        hooks.insert(rpc_id, tx);
        Ok(rx)
    }

    pub(crate) fn inner(&self) -> Arc<NexusInner> {
        self.inner.clone()
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(h) = self.listener.take() {
            let _ = h.join();
        }
    }
}

fn sm_listener(inner: Arc<NexusInner>) {
    let mut buf = [0u8; SM_PKT_SIZE];
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        match inner.socket.recv_from(&mut buf) {
            Ok((len, from)) => match SmPkt::from_bytes(&buf[..len]) {
                Some(pkt) => inner.route(pkt),
                None => log::debug!("malformed sm datagram from {from} dropped"),
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
            Err(e) => {
                log::error!("sm listener exiting: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RoutingInfo;

    fn connect_req(server_rpc_id: u8, client_uri: &str) -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrCode::Ok,
            client_rpc_id: 1,
            server_rpc_id,
            client_session_num: 0,
            server_session_num: 0,
            uniq_token: 7,
            client_uri: client_uri.to_string(),
            server_uri: String::new(),
            client_routing: RoutingInfo::default(),
            server_routing: RoutingInfo::default(),
        }
    }

    #[test]
    fn routes_to_registered_inbox() {
        let a = Nexus::new("127.0.0.1:0").unwrap();
        let b = Nexus::new("127.0.0.1:0").unwrap();
        let mut inbox = b.register_rpc(5).unwrap();

        let pkt = connect_req(5, a.local_uri());
        a.inner().sm_send(b.local_uri(), &pkt).unwrap();

        let mut got = None;
        for _ in 0..200 {
            if let Ok(p) = inbox.try_recv() {
                got = Some(p);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let got = got.expect("sm packet not routed");
        assert_eq!(got.uniq_token, 7);
        assert_eq!(got.server_rpc_id, 5);
    }

    #[test]
    fn unknown_rpc_gets_reject_reply() {
        let a = Nexus::new("127.0.0.1:0").unwrap();
        let b = Nexus::new("127.0.0.1:0").unwrap();
        let mut a_inbox = a.register_rpc(1).unwrap();

        // rpc 9 does not exist on b; b replies with InvalidRpcId to a.
        let pkt = connect_req(9, a.local_uri());
        a.inner().sm_send(b.local_uri(), &pkt).unwrap();

        let mut got = None;
        for _ in 0..200 {
            if let Ok(p) = a_inbox.try_recv() {
                got = Some(p);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let got = got.expect("reject reply not delivered");
        assert_eq!(got.pkt_type, SmPktType::ConnectResp);
        assert_eq!(got.err, SmErrCode::InvalidRpcId);
    }

    #[test]
    fn duplicate_rpc_id_rejected() {
        let n = Nexus::new("127.0.0.1:0").unwrap();
        let _rx = n.register_rpc(2).unwrap();
        assert!(n.register_rpc(2).is_err());
    }
}
