//! UDP datagram transport.
//!
//! A development and test transport that satisfies the [`Transport`]
//! capability set over a nonblocking `std::net::UdpSocket`. Routing info
//! packs the peer's socket address into the opaque 32-byte blob. Memory
//! registration is a no-op; every buffer shares a zero lkey.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;
use crate::transport::{
    MemRegInfo, MemRegistrar, RoutingInfo, Transport, TxBurstItem, MAX_ROUTING_INFO_SIZE,
};

/// Packets pulled per rx_burst call.
pub const RX_BURST_SIZE: usize = 16;

/// Receive-ring depth.
pub const RX_RING_DEPTH: usize = 1024;

/// Default packet size, header included.
pub const DEFAULT_MTU: usize = 1024;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;
const RESOLVED_FLAG_OFFSET: usize = 20;

/// Counters exposed for tests, mirroring the drop/flush observability the
/// datapath cannot log per packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransportTesting {
    /// Times `tx_flush` has been called.
    pub tx_flush_count: usize,
    /// Packets discarded through the `TxBurstItem::drop` fault.
    pub pkts_dropped: usize,
}

struct RingSlot {
    buf: Box<[u8]>,
    len: usize,
}

/// Datagram transport over a nonblocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    mtu: usize,
    slots: Vec<RingSlot>,
    mask: usize,
    /// Packets ever received into the ring.
    fill_ctr: usize,
    /// Packets returned to the ring via `post_recvs`.
    consume_ctr: usize,
    burst_start: usize,
    burst_len: usize,
    scratch: Vec<u8>,
    fatal: Option<String>,
    pub testing: UdpTransportTesting,
}

impl UdpTransport {
    /// Bind a transport with the default MTU.
    pub fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_mtu(addr, DEFAULT_MTU)
    }

    /// Bind a transport with an explicit MTU (header included).
    pub fn bind_with_mtu(addr: &str, mtu: usize) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE || mtu > 65000 {
            return Err(Error::InvalidConfig("mtu out of range"));
        }
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let depth = RX_RING_DEPTH;
        let slots = (0..depth)
            .map(|_| RingSlot {
                buf: vec![0u8; mtu].into_boxed_slice(),
                len: 0,
            })
            .collect();

        Ok(Self {
            socket,
            mtu,
            slots,
            mask: depth - 1,
            fill_ctr: 0,
            consume_ctr: 0,
            burst_start: 0,
            burst_len: 0,
            scratch: vec![0u8; mtu],
            fatal: None,
            testing: UdpTransportTesting::default(),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn pack_addr(addr: SocketAddr, routing: &mut RoutingInfo) {
        routing.buf = [0; MAX_ROUTING_INFO_SIZE];
        routing.buf[1..3].copy_from_slice(&addr.port().to_le_bytes());
        match addr.ip() {
            IpAddr::V4(ip) => {
                routing.buf[0] = FAMILY_V4;
                routing.buf[4..8].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                routing.buf[0] = FAMILY_V6;
                routing.buf[4..20].copy_from_slice(&ip.octets());
            }
        }
    }

    fn unpack_addr(routing: &RoutingInfo) -> Option<SocketAddr> {
        let port = u16::from_le_bytes([routing.buf[1], routing.buf[2]]);
        match routing.buf[0] {
            FAMILY_V4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&routing.buf[4..8]);
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(o)), port))
            }
            FAMILY_V6 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&routing.buf[4..20]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(o)), port))
            }
            _ => None,
        }
    }

    /// Errors that mean "the wire ate it", not "the endpoint is broken".
    fn is_benign(kind: std::io::ErrorKind) -> bool {
        matches!(
            kind,
            std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::PermissionDenied
        )
    }
}

impl MemRegistrar for UdpTransport {
    fn reg_mr(&mut self, _ptr: *mut u8, _len: usize) -> MemRegInfo {
        MemRegInfo {
            transport_mr: 0,
            lkey: 0,
        }
    }

    fn dereg_mr(&mut self, _info: MemRegInfo) {}
}

impl Transport for UdpTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn rx_ring_depth(&self) -> usize {
        self.slots.len()
    }

    fn fill_local_routing_info(&self, routing: &mut RoutingInfo) {
        match self.socket.local_addr() {
            Ok(addr) => Self::pack_addr(addr, routing),
            Err(e) => {
                log::error!("local_addr failed: {e}");
                routing.buf = [0; MAX_ROUTING_INFO_SIZE];
            }
        }
    }

    fn resolve_remote_routing_info(&self, routing: &mut RoutingInfo) -> bool {
        match Self::unpack_addr(routing) {
            Some(addr) if addr.port() != 0 => {
                routing.buf[RESOLVED_FLAG_OFFSET] = 1;
                true
            }
            _ => false,
        }
    }

    fn tx_burst(&mut self, items: &[TxBurstItem]) {
        for item in items {
            if item.drop {
                self.testing.pkts_dropped += 1;
                continue;
            }
            let Some(addr) = Self::unpack_addr(&item.routing) else {
                log::error!("tx_burst: unroutable packet dropped");
                continue;
            };

            let total = PKT_HDR_SIZE + item.payload_len as usize;
            debug_assert!(total <= self.mtu);
            item.hdr.write_to(&mut self.scratch[..PKT_HDR_SIZE]);
            if item.payload_len > 0 {
                // Safety: the payload points into a slot-owned MsgBuffer that
                // outlives the burst; see TxBurstItem.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        item.payload,
                        self.scratch.as_mut_ptr().add(PKT_HDR_SIZE),
                        item.payload_len as usize,
                    );
                }
            }

            if let Err(e) = self.socket.send_to(&self.scratch[..total], addr) {
                if !Self::is_benign(e.kind()) {
                    self.fatal = Some(format!("send_to: {e}"));
                }
            }
        }
    }

    fn tx_flush(&mut self) {
        // Datagram sends complete synchronously; flushing only needs to be
        // observable.
        self.testing.tx_flush_count += 1;
    }

    fn rx_burst(&mut self) -> usize {
        self.burst_start = self.fill_ctr;
        let mut n = 0;
        while n < RX_BURST_SIZE && self.fill_ctr - self.consume_ctr < self.slots.len() {
            let slot = &mut self.slots[self.fill_ctr & self.mask];
            match self.socket.recv(&mut slot.buf) {
                Ok(len) => {
                    slot.len = len;
                    self.fill_ctr += 1;
                    n += 1;
                }
                Err(e) if Self::is_benign(e.kind()) => break,
                Err(e) => {
                    self.fatal = Some(format!("recv: {e}"));
                    break;
                }
            }
        }
        self.burst_len = n;
        n
    }

    fn rx_pkt(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.burst_len);
        let slot = &self.slots[(self.burst_start + idx) & self.mask];
        &slot.buf[..slot.len]
    }

    fn post_recvs(&mut self, n: usize) {
        debug_assert!(self.consume_ctr + n <= self.fill_ctr);
        self.consume_ctr += n;
    }

    fn fatal_fault(&self) -> Option<String> {
        self.fatal.clone()
    }
}
