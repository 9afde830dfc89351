//! Sessions and session slots.
//!
//! A session is a bidirectional context between two endpoints with a fixed
//! window of slots, each slot one in-flight request. All state here is owned
//! and mutated by the dispatch thread only.

use crate::buffer::MsgBuffer;
use crate::cc::Timely;
use crate::rpc::Continuation;
use crate::transport::RoutingInfo;

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the peer.
    ConnectInProgress,
    /// Ready for requests.
    Connected,
    /// Disconnect request sent, waiting for the peer.
    DisconnectInProgress,
    /// Fatal fault; outstanding requests are being failed.
    ResetInProgress,
}

/// Duplicate-tracking bitmap for offset-indexed reassembly.
///
/// Fragments of one message may arrive in any order; the bitmap records which
/// offsets have landed so duplicates are recognized without sequencing.
#[derive(Debug, Default)]
pub struct RxBitmap {
    words: Vec<u64>,
    num_set: usize,
}

impl RxBitmap {
    pub fn reset(&mut self, num_pkts: usize) {
        self.words.clear();
        self.words.resize(num_pkts.div_ceil(64), 0);
        self.num_set = 0;
    }

    /// Mark fragment `idx` received. Returns false if it was already set.
    pub fn set(&mut self, idx: usize) -> bool {
        let (word, bit) = (idx / 64, idx % 64);
        if word >= self.words.len() {
            return false;
        }
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.num_set += 1;
        true
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        let (word, bit) = (idx / 64, idx % 64);
        word < self.words.len() && self.words[word] & (1 << bit) != 0
    }

    #[inline]
    pub fn num_set(&self) -> usize {
        self.num_set
    }

    /// Lowest unset fragment index at or after `from`, if any.
    pub fn first_missing_from(&self, from: usize, num_pkts: usize) -> Option<usize> {
        (from..num_pkts).find(|&i| !self.get(i))
    }
}

/// Client-side slot counters and continuation state.
#[derive(Default)]
pub struct ClientInfo {
    /// Data and request-for-response packets transmitted for the current
    /// request, duplicates included.
    pub num_tx: usize,
    /// Matched acknowledgements (response fragments and explicit credit
    /// returns) received.
    pub num_rx: usize,
    /// Packets sitting in the timing wheel. They hold credits but have not
    /// advanced `num_tx` yet.
    pub in_wheel: usize,
    /// TSC of the last `num_rx` advance; the retransmission clock baseline.
    pub progress_tsc: u64,
    /// Transmit timestamps for RTT sampling, indexed modulo the credit count.
    pub tx_ts: Vec<u64>,
    pub cont: Option<Continuation>,
    pub tag: u64,
    /// Request fragments the server has acknowledged (explicit credit
    /// returns carry the fragment index). Retransmission targets the unacked
    /// ones, so out-of-order loss converges.
    pub req_ack_bitmap: RxBitmap,
    /// Next request fragment to transmit.
    pub next_req_frag: usize,
    /// Response reassembly state; zero until the first response fragment.
    pub resp_msg_size: usize,
    pub resp_num_pkts: usize,
    pub rx_bitmap: RxBitmap,
    /// Next response fragment to pull with an RFR.
    pub next_rfr_frag: usize,
    /// Retransmissions charged to the current request.
    pub num_retx: u32,
    /// Completed response handed to a background worker; the slot stays
    /// reserved (and visible to the loss scan) until the worker finishes.
    pub bg_cont_pending: bool,
}

/// Server-side slot reassembly and response-cache state.
#[derive(Default)]
pub struct ServerInfo {
    /// Request fragments received, duplicates excluded.
    pub req_msg_size: usize,
    pub num_req_pkts: usize,
    pub rx_bitmap: RxBitmap,
    /// Request complete and handed to a handler, response not yet enqueued.
    pub handler_pending: bool,
}

/// One in-flight request reservation.
///
/// `tx_msgbuf` doubles as the completion flag on the client (None ⇔ response
/// received and handed off) and as the cached response on the server (kept
/// for duplicate-request retransmission until the slot is reused).
pub struct SSlot {
    pub index: u8,
    /// Monotonic per slot, advancing by the request window between reuses so
    /// request numbers are unique per session modulo wraparound.
    pub cur_req_num: u64,
    pub req_type: u8,
    pub tx_msgbuf: Option<MsgBuffer>,
    pub rx_msgbuf: Option<MsgBuffer>,
    pub client: ClientInfo,
    pub server: ServerInfo,
    pub in_stallq: bool,
}

impl SSlot {
    fn new(index: u8, session_credits: usize) -> Self {
        Self {
            index,
            cur_req_num: index as u64,
            req_type: 0,
            tx_msgbuf: None,
            rx_msgbuf: None,
            client: ClientInfo {
                tx_ts: vec![0; session_credits],
                ..ClientInfo::default()
            },
            server: ServerInfo::default(),
            in_stallq: false,
        }
    }

    /// Request-data packets of the current request.
    #[inline]
    pub fn req_pkts(&self) -> usize {
        self.tx_msgbuf.as_ref().map_or(0, |b| b.num_pkts())
    }

    /// Next request fragment that still needs transmission, if any. Once the
    /// first response fragment arrives the request is implicitly delivered
    /// and nothing more is sent from it.
    pub fn next_unsent_req_frag(&self) -> Option<usize> {
        if self.tx_msgbuf.is_none() || self.client.resp_num_pkts > 0 {
            return None;
        }
        let req_pkts = self.req_pkts();
        self.client
            .req_ack_bitmap
            .first_missing_from(self.client.next_req_frag, req_pkts)
    }

    /// Next response fragment that still needs an RFR, if any.
    pub fn next_unsent_rfr_frag(&self) -> Option<usize> {
        if self.tx_msgbuf.is_none() || self.client.resp_num_pkts == 0 {
            return None;
        }
        self.client.rx_bitmap.first_missing_from(
            self.client.next_rfr_frag.max(1),
            self.client.resp_num_pkts,
        )
    }

    /// Whether unsent work remains for this client slot.
    #[inline]
    pub fn has_unsent_pkts(&self) -> bool {
        self.next_unsent_req_frag().is_some() || self.next_unsent_rfr_frag().is_some()
    }
}

/// A bidirectional communication context with one peer.
pub struct Session {
    pub role: Role,
    pub state: SessionState,
    pub local_session_num: u16,
    pub remote_session_num: u16,
    /// Resolved routing info for the peer's data path.
    pub remote_routing: RoutingInfo,
    /// Peer's session-management URI.
    pub remote_uri: String,
    pub remote_rpc_id: u8,
    pub slots: Vec<SSlot>,
    /// Free client-slot stack.
    pub free_slots: Vec<u8>,
    /// Flow-control credits; sending any data packet takes one.
    pub credits: usize,
    pub cc: Timely,
    /// Rate-pacer bookkeeping: the last assigned wheel dispatch time.
    pub prev_desired_tx_tsc: u64,
    /// TSC of the last session-management request sent.
    pub sm_req_ts: u64,
    pub sm_retries: u32,
    /// Distinguishes retried connect handshakes from unrelated peers.
    pub uniq_token: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        local_session_num: u16,
        remote_uri: String,
        remote_rpc_id: u8,
        req_window: usize,
        session_credits: usize,
        cc: Timely,
        uniq_token: u64,
    ) -> Self {
        let slots = (0..req_window)
            .map(|i| SSlot::new(i as u8, session_credits))
            .collect();
        // Pop order matches slot order for predictable first allocations.
        let free_slots = (0..req_window as u8).rev().collect();
        Self {
            role,
            state: match role {
                Role::Client => SessionState::ConnectInProgress,
                Role::Server => SessionState::Connected,
            },
            local_session_num,
            remote_session_num: 0,
            remote_routing: RoutingInfo::default(),
            remote_uri,
            remote_rpc_id,
            slots,
            free_slots,
            credits: session_credits,
            cc,
            prev_desired_tx_tsc: 0,
            sm_req_ts: 0,
            sm_retries: 0,
            uniq_token,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Slot index owning `req_num` under fixed slot assignment.
    #[inline]
    pub fn slot_of(&self, req_num: u64) -> usize {
        (req_num % self.slots.len() as u64) as usize
    }

    /// Outstanding packets across all slots: `Σ (num_tx − num_rx)`.
    pub fn outstanding_pkts(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.client.num_tx.saturating_sub(s.client.num_rx))
            .sum()
    }

    /// Busy client slots (request issued, continuation not yet released).
    pub fn busy_slots(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_session() -> Session {
        Session::new(
            Role::Client,
            3,
            "127.0.0.1:31850".to_string(),
            0,
            8,
            8,
            Timely::new(10.0, 2.0),
            42,
        )
    }

    #[test]
    fn slot_req_nums_are_disjoint() {
        let s = client_session();
        for (i, slot) in s.slots.iter().enumerate() {
            assert_eq!(slot.cur_req_num % 8, i as u64);
            assert_eq!(s.slot_of(slot.cur_req_num), i);
            assert_eq!(s.slot_of(slot.cur_req_num + 8), i);
        }
    }

    #[test]
    fn free_slot_stack_starts_full() {
        let mut s = client_session();
        assert_eq!(s.busy_slots(), 0);
        assert_eq!(s.free_slots.pop(), Some(0));
        assert_eq!(s.busy_slots(), 1);
    }

    #[test]
    fn bitmap_dedupes_and_counts() {
        let mut bm = RxBitmap::default();
        bm.reset(4);
        assert!(bm.set(2));
        assert!(!bm.set(2));
        assert!(bm.set(0));
        assert_eq!(bm.num_set(), 2);
        assert_eq!(bm.first_missing_from(0, 4), Some(1));
        assert_eq!(bm.first_missing_from(3, 4), Some(3));
        assert!(bm.set(1));
        assert!(bm.set(3));
        assert_eq!(bm.first_missing_from(0, 4), None);
    }

    #[test]
    fn bitmap_handles_wide_messages() {
        let mut bm = RxBitmap::default();
        bm.reset(130);
        assert!(bm.set(129));
        assert!(bm.get(129));
        assert!(!bm.get(128));
        assert_eq!(bm.first_missing_from(128, 130), Some(128));
    }

    #[test]
    fn unsent_work_follows_cursors_and_acks() {
        let mut s = client_session();
        let slot = &mut s.slots[0];
        // No request outstanding: nothing to send.
        assert_eq!(slot.next_unsent_req_frag(), None);
        assert_eq!(slot.next_unsent_rfr_frag(), None);

        // A four-fragment response needs RFRs for fragments 1..4.
        slot.client.resp_num_pkts = 4;
        slot.client.next_rfr_frag = 1;
        slot.client.rx_bitmap.reset(4);
        slot.client.rx_bitmap.set(0);
        slot.tx_msgbuf = None;
        assert_eq!(slot.next_unsent_rfr_frag(), None); // no outstanding request

        slot.client.rx_bitmap.set(2);
        slot.client.next_rfr_frag = 1;
        // With fragment 2 already present, the first RFR target is 1, and
        // after advancing past it the next is 3.
        assert_eq!(
            slot.client.rx_bitmap.first_missing_from(1, 4),
            Some(1)
        );
        assert_eq!(
            slot.client.rx_bitmap.first_missing_from(2, 4),
            Some(3)
        );
    }
}
