//! Transport abstraction.
//!
//! The endpoint is generic over a transport capability set resolved at
//! construction, so the dispatch loop is monomorphic per transport and the
//! hot path stays inlined. Implementations own their RX ring and DMA buffer
//! pools; the endpoint posts receive descriptors explicitly to control when
//! memory becomes visible to the NIC.

use crate::packet::{PktHdr, PKT_HDR_SIZE};

/// Space reserved for opaque routing info, any transport.
pub const MAX_ROUTING_INFO_SIZE: usize = 32;

/// Opaque routing info blob.
///
/// Holds both cluster-wide valid members (e.g. an address) and members that
/// are only locally meaningful after resolution.
#[derive(Clone, Copy)]
pub struct RoutingInfo {
    pub buf: [u8; MAX_ROUTING_INFO_SIZE],
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self {
            buf: [0; MAX_ROUTING_INFO_SIZE],
        }
    }
}

impl std::fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingInfo({:02x?}...)", &self.buf[..8])
    }
}

/// Memory-registration record for one region.
#[derive(Debug, Clone, Copy)]
pub struct MemRegInfo {
    /// Transport-specific region handle, opaque to the allocator.
    pub transport_mr: usize,
    /// Local key for the region.
    pub lkey: u32,
}

impl Default for MemRegInfo {
    fn default() -> Self {
        Self {
            transport_mr: 0,
            lkey: 0xffff_ffff,
        }
    }
}

/// Memory registration hooks, used by the hugepage allocator.
pub trait MemRegistrar {
    fn reg_mr(&mut self, ptr: *mut u8, len: usize) -> MemRegInfo;
    fn dereg_mr(&mut self, info: MemRegInfo);
}

/// One packet queued for transmission.
///
/// The payload is referenced by raw parts; the backing message buffer is
/// owned by a session slot and stays allocated at least until `tx_flush`
/// returns, which the retransmission path relies on.
#[derive(Debug, Clone, Copy)]
pub struct TxBurstItem {
    pub routing: RoutingInfo,
    pub hdr: PktHdr,
    /// Payload pointer; null for header-only packets (RFR, ExplCr).
    pub payload: *const u8,
    pub payload_len: u32,
    /// Drop this packet instead of sending it. Testing only.
    pub drop: bool,
}

impl TxBurstItem {
    /// A header-only packet (credit return or request-for-response).
    pub fn control(routing: RoutingInfo, hdr: PktHdr) -> Self {
        Self {
            routing,
            hdr,
            payload: std::ptr::null(),
            payload_len: 0,
            drop: false,
        }
    }
}

/// Transport capability set.
///
/// All methods are non-blocking; `rx_burst` and `tx_burst` are polled from
/// the dispatch loop.
pub trait Transport: MemRegistrar {
    /// Maximum bytes per fabric packet, header included.
    fn mtu(&self) -> usize;

    /// Receive-ring depth, i.e. how many descriptors can be posted.
    fn rx_ring_depth(&self) -> usize;

    /// Data bytes per packet after the header.
    #[inline]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - PKT_HDR_SIZE
    }

    /// Number of packets needed for `data_size` data bytes. Avoids division
    /// for the common single-packet case; zero-byte messages still take one
    /// packet.
    #[inline]
    fn data_size_to_num_pkts(&self, data_size: usize) -> usize {
        let per_pkt = self.max_data_per_pkt();
        if data_size <= per_pkt {
            1
        } else {
            data_size.div_ceil(per_pkt)
        }
    }

    /// Fill in this endpoint's routing info for peers.
    fn fill_local_routing_info(&self, routing: &mut RoutingInfo);

    /// Resolve a peer's routing info into locally usable form, in place.
    /// Returns false if the info is unusable from this endpoint.
    fn resolve_remote_routing_info(&self, routing: &mut RoutingInfo) -> bool;

    /// Transmit a batch of packets.
    fn tx_burst(&mut self, items: &[TxBurstItem]);

    /// Force completion of all posted sends, returning buffer ownership to
    /// the endpoint. Expensive; used only on retransmission and shutdown.
    fn tx_flush(&mut self);

    /// Poll for received packets. Returns how many are readable through
    /// [`rx_pkt`](Transport::rx_pkt) until the next call.
    fn rx_burst(&mut self) -> usize;

    /// Borrow the `idx`-th packet of the last burst.
    fn rx_pkt(&self, idx: usize) -> &[u8];

    /// Return `n` consumed descriptors to the receive ring.
    fn post_recvs(&mut self, n: usize);

    /// Fatal transport fault, if one has occurred.
    fn fatal_fault(&self) -> Option<String> {
        None
    }
}
