//! The endpoint and its dispatch loop.
//!
//! An `Rpc` is bound to one transport instance and one rpc id within a
//! [`Nexus`](crate::nexus::Nexus). It owns the session table, the hugepage
//! allocator, the timing wheel and the credit-stall queue, and is the sole
//! mutator of all of them: the dispatch loop never blocks, and background
//! workers only ever hand results back through completion rings.
//!
//! Endpoints are not thread-safe and must stay pinned to one thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use slab::Slab;

use crate::bg::{self, BgCompletion, BgWorkItem, BgWorker};
use crate::buffer::{HugeAlloc, MsgBuffer};
use crate::cc::Timely;
use crate::config::{Faults, RpcConfig, PKT_LOSS_SCAN_INTERVAL_MS, SM_SCAN_INTERVAL_MS};
use crate::error::{EnqueueError, Error, Result};
use crate::nexus::{HandlerKind, Nexus, NexusInner, ReqHandle, ReqHandlerEntry};
use crate::packet::{PktHdr, PktType, MAX_PKT_NUM, PKT_HDR_SIZE};
use crate::session::{Role, SSlot, Session, SessionState};
use crate::sm::{SmErrCode, SmEvent, SmPkt, SmPktType};
use crate::transport::{RoutingInfo, Transport, TxBurstItem};
use crate::tsc::{self, rdtsc};
use crate::wheel::{TimingWheel, WheelEnt};

/// Packets batched before a transmit burst is forced.
pub const TX_BATCH_SIZE: usize = 32;

/// Everything a continuation receives when its request retires: the caller's
/// buffers come back together with the outcome.
pub struct ContCtx {
    pub req_msgbuf: MsgBuffer,
    pub resp_msgbuf: MsgBuffer,
    pub result: Result<()>,
    pub tag: u64,
}

/// Client-side completion callback.
pub type Continuation = Box<dyn FnOnce(ContCtx) + Send + 'static>;

/// Session-management event callback.
pub type SmHandler = Box<dyn FnMut(u16, SmEvent, Option<Error>)>;

/// Loss-detection counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktLossStats {
    /// Requests rolled back and retransmitted.
    pub num_retransmissions: u64,
    /// RTO expiries that turned out to be in-flight completions or credit
    /// stalls; nothing was sent.
    pub num_false_positives: u64,
}

/// Datapath counters. Anomalies are dropped silently; these are the trace
/// they leave.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpathStats {
    pub tx_pkts: u64,
    pub rx_pkts: u64,
    pub rx_drop_bad_hdr: u64,
    pub rx_drop_unknown_session: u64,
    pub rx_drop_stale: u64,
    pub rx_dup: u64,
    /// Times a slot parked on the credit-stall queue.
    pub stall_events: u64,
}

enum RespOutcome {
    KickRfr {
        slot_idx: usize,
    },
    CompleteFg {
        cont: Option<Continuation>,
        ctx: ContCtx,
    },
    CompleteBg {
        cont: Continuation,
        ctx: ContCtx,
        slot_idx: u8,
    },
}

enum ReqOutcome {
    Done,
    ResendResp0,
    Invoke { handle: ReqHandle },
}

/// An RPC endpoint: one dispatch context over one transport.
pub struct Rpc<T: Transport> {
    rpc_id: u8,
    nexus: Arc<NexusInner>,
    transport: T,
    alloc: HugeAlloc,
    config: RpcConfig,
    freq_ghz: f64,
    rto_cycles: u64,

    sessions: Slab<Session>,
    req_handlers: Vec<Option<ReqHandlerEntry>>,
    sm_handler: SmHandler,
    sm_rx: spsc_ring::Consumer<SmPkt>,
    local_routing: RoutingInfo,

    ev_loop_tsc: u64,
    tx_batch: Vec<TxBurstItem>,
    stallq: VecDeque<(u16, u8)>,
    wheel: TimingWheel,
    wheel_drain: Vec<WheelEnt>,
    rx_scratch: Vec<u8>,

    bg_workers: Vec<BgWorker>,
    bg_handles: Vec<JoinHandle<()>>,
    bg_next: usize,

    faults: Faults,
    pkt_loss_stats: PktLossStats,
    dpath_stats: DpathStats,

    pkt_loss_scan_cycles: u64,
    last_pkt_loss_scan_tsc: u64,
    sm_scan_cycles: u64,
    last_sm_scan_tsc: u64,
}

impl<T: Transport> Rpc<T> {
    /// Create an endpoint on `transport`, registered with `nexus` as
    /// `rpc_id`. Session-management events reach the application through
    /// `sm_handler`.
    pub fn new(
        nexus: &Nexus,
        rpc_id: u8,
        transport: T,
        config: RpcConfig,
        sm_handler: SmHandler,
    ) -> Result<Self> {
        if config.req_window == 0 || config.req_window > 64 {
            return Err(Error::InvalidConfig("req_window must be in 1..=64"));
        }
        if config.session_credits == 0 {
            return Err(Error::InvalidConfig("session_credits must be nonzero"));
        }
        if config.max_sessions > u16::MAX as usize {
            return Err(Error::InvalidConfig("max_sessions exceeds u16 space"));
        }

        let freq_ghz = tsc::measure_freq_ghz();
        let now = rdtsc();
        let mut local_routing = RoutingInfo::default();
        transport.fill_local_routing_info(&mut local_routing);

        let sm_rx = nexus.register_rpc(rpc_id)?;
        let req_handlers = nexus.handler_snapshot();
        let wheel = TimingWheel::new(
            config.wheel_num_buckets,
            tsc::ns_to_cycles(config.wheel_bucket_width_ns, freq_ghz),
            now,
        );
        let (bg_workers, bg_handles) = bg::spawn_workers(config.num_bg_threads);

        Ok(Self {
            rpc_id,
            nexus: nexus.inner(),
            transport,
            alloc: HugeAlloc::new(),
            rto_cycles: tsc::ms_to_cycles(config.rto_ms, freq_ghz),
            pkt_loss_scan_cycles: tsc::ms_to_cycles(PKT_LOSS_SCAN_INTERVAL_MS, freq_ghz),
            sm_scan_cycles: tsc::ms_to_cycles(SM_SCAN_INTERVAL_MS, freq_ghz),
            config,
            freq_ghz,
            sessions: Slab::new(),
            req_handlers,
            sm_handler,
            sm_rx,
            local_routing,
            ev_loop_tsc: now,
            tx_batch: Vec::with_capacity(TX_BATCH_SIZE),
            stallq: VecDeque::new(),
            wheel,
            wheel_drain: Vec::new(),
            rx_scratch: Vec::new(),
            bg_workers,
            bg_handles,
            bg_next: 0,
            faults: Faults::default(),
            pkt_loss_stats: PktLossStats::default(),
            dpath_stats: DpathStats::default(),
            last_pkt_loss_scan_tsc: now,
            last_sm_scan_tsc: now,
        })
    }

    // ------------------------------------------------------------------
    // Message buffers
    // ------------------------------------------------------------------

    /// Allocate a registered buffer holding up to `max_data_size` bytes.
    pub fn alloc_msg_buffer(&mut self, max_data_size: usize) -> Result<MsgBuffer> {
        let num_pkts = self.transport.data_size_to_num_pkts(max_data_size);
        if num_pkts > MAX_PKT_NUM as usize {
            return Err(Error::InvalidConfig("message spans too many packets"));
        }
        let raw = self
            .alloc
            .alloc(max_data_size.max(1), &mut self.transport)
            .ok_or(Error::InvalidConfig("buffer allocation failed"))?;
        Ok(MsgBuffer::from_raw(raw, max_data_size, num_pkts))
    }

    /// Shrink (or re-expand, up to capacity) a buffer's message size.
    pub fn resize_msg_buffer(&self, mbuf: &mut MsgBuffer, data_size: usize) {
        assert!(data_size <= mbuf.max_data_size());
        let num_pkts = self.transport.data_size_to_num_pkts(data_size);
        mbuf.set_size(data_size, num_pkts);
    }

    /// Return a buffer to the allocator.
    pub fn free_msg_buffer(&mut self, mbuf: MsgBuffer) {
        self.alloc.free(mbuf.into_raw());
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Start connecting to `(remote_uri, remote_rpc_id)`. Completes
    /// asynchronously: the sm handler sees `ConnectSuccess` or
    /// `ConnectFailed`.
    pub fn create_session(&mut self, remote_uri: &str, remote_rpc_id: u8) -> Result<u16> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(Error::InvalidConfig("session table full"));
        }
        let token = rand::random::<u64>();
        let entry = self.sessions.vacant_entry();
        let session_num = entry.key() as u16;
        let sess = Session::new(
            Role::Client,
            session_num,
            remote_uri.to_string(),
            remote_rpc_id,
            self.config.req_window,
            self.config.session_credits,
            Timely::new(self.config.link_bandwidth_gbps, self.freq_ghz),
            token,
        );
        entry.insert(sess);
        if let Err(e) = self.send_connect_req(session_num) {
            self.sessions.remove(session_num as usize);
            return Err(e);
        }
        Ok(session_num)
    }

    /// Start disconnecting a client session. All slots must be idle.
    pub fn destroy_session(&mut self, session_num: u16) -> Result<()> {
        let sess = self
            .sessions
            .get_mut(session_num as usize)
            .ok_or(Error::InvalidConfig("no such session"))?;
        if sess.role != Role::Client || sess.state != SessionState::Connected {
            return Err(Error::InvalidConfig("session not connected"));
        }
        if sess.busy_slots() > 0 {
            return Err(Error::InvalidConfig("session has outstanding requests"));
        }
        sess.state = SessionState::DisconnectInProgress;
        sess.sm_retries = 0;
        self.send_disconnect_req(session_num)
    }

    fn send_connect_req(&mut self, session_num: u16) -> Result<()> {
        let sess = match self.sessions.get_mut(session_num as usize) {
            Some(s) => s,
            None => return Ok(()),
        };
        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrCode::Ok,
            client_rpc_id: self.rpc_id,
            server_rpc_id: sess.remote_rpc_id,
            client_session_num: session_num,
            server_session_num: 0,
            uniq_token: sess.uniq_token,
            client_uri: self.nexus.local_uri().to_string(),
            server_uri: sess.remote_uri.clone(),
            client_routing: self.local_routing,
            server_routing: RoutingInfo::default(),
        };
        sess.sm_req_ts = rdtsc();
        self.nexus.sm_send(&pkt.server_uri.clone(), &pkt)
    }

    fn send_disconnect_req(&mut self, session_num: u16) -> Result<()> {
        let sess = match self.sessions.get_mut(session_num as usize) {
            Some(s) => s,
            None => return Ok(()),
        };
        let pkt = SmPkt {
            pkt_type: SmPktType::DisconnectReq,
            err: SmErrCode::Ok,
            client_rpc_id: self.rpc_id,
            server_rpc_id: sess.remote_rpc_id,
            client_session_num: session_num,
            server_session_num: sess.remote_session_num,
            uniq_token: sess.uniq_token,
            client_uri: self.nexus.local_uri().to_string(),
            server_uri: sess.remote_uri.clone(),
            client_routing: self.local_routing,
            server_routing: RoutingInfo::default(),
        };
        sess.sm_req_ts = rdtsc();
        self.nexus.sm_send(&pkt.server_uri.clone(), &pkt)
    }

    // ------------------------------------------------------------------
    // Request submission (TX path)
    // ------------------------------------------------------------------

    /// Issue a request on a connected session. The continuation fires when
    /// the full response has landed in `resp_msgbuf` (or with an error);
    /// both buffers travel back through it.
    pub fn enqueue_request(
        &mut self,
        session_num: u16,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> std::result::Result<(), EnqueueError> {
        let fail = |error, req_msgbuf, resp_msgbuf| {
            Err(EnqueueError {
                error,
                req_msgbuf,
                resp_msgbuf,
            })
        };

        let slot_idx = {
            let sess = match self.sessions.get_mut(session_num as usize) {
                Some(s) if s.role == Role::Client => s,
                _ => {
                    return fail(
                        Error::InvalidConfig("no such client session"),
                        req_msgbuf,
                        resp_msgbuf,
                    )
                }
            };
            if !sess.is_connected() {
                return fail(
                    Error::SessionConnectFailed("session not connected"),
                    req_msgbuf,
                    resp_msgbuf,
                );
            }
            let Some(slot_idx) = sess.free_slots.pop() else {
                return fail(Error::TooManyOutstanding, req_msgbuf, resp_msgbuf);
            };

            let req_window = sess.slots.len() as u64;
            let req_num_pkts = req_msgbuf.num_pkts();
            let slot = &mut sess.slots[slot_idx as usize];
            slot.cur_req_num += req_window;
            slot.req_type = req_type;
            slot.tx_msgbuf = Some(req_msgbuf);
            slot.rx_msgbuf = Some(resp_msgbuf);

            let ci = &mut slot.client;
            ci.num_tx = 0;
            ci.num_rx = 0;
            ci.in_wheel = 0;
            ci.progress_tsc = self.ev_loop_tsc;
            ci.cont = Some(cont);
            ci.tag = tag;
            ci.req_ack_bitmap.reset(req_num_pkts);
            ci.next_req_frag = 0;
            ci.resp_msg_size = 0;
            ci.resp_num_pkts = 0;
            ci.next_rfr_frag = 1;
            ci.num_retx = 0;
            ci.bg_cont_pending = false;
            slot_idx as usize
        };

        self.kick_req(session_num, slot_idx);
        Ok(())
    }

    #[inline]
    fn pacing_enabled(&self) -> bool {
        self.config.enable_cc && !self.faults.hard_wheel_bypass
    }

    /// Transmit request fragments from the slot's cursor as credits allow.
    fn kick_req(&mut self, session_num: u16, slot_idx: usize) {
        let pacing = self.pacing_enabled();
        let max_data = self.transport.max_data_per_pkt();
        let mtu = self.transport.mtu();
        loop {
            let ev_tsc = self.ev_loop_tsc;
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                return;
            };
            if !sess.is_connected() {
                return;
            }
            let routing = sess.remote_routing;
            let remote_session = sess.remote_session_num;

            let Some(frag) = sess.slots[slot_idx].next_unsent_req_frag() else {
                return;
            };
            if sess.credits == 0 {
                let slot = &mut sess.slots[slot_idx];
                if !slot.in_stallq {
                    slot.in_stallq = true;
                    self.stallq.push_back((session_num, slot_idx as u8));
                    self.dpath_stats.stall_events += 1;
                }
                return;
            }

            sess.credits -= 1;
            if pacing {
                let spacing = sess.cc.pkt_spacing_tsc(mtu);
                let desired = sess.prev_desired_tx_tsc.max(ev_tsc) + spacing;
                sess.prev_desired_tx_tsc = desired;
                let slot = &mut sess.slots[slot_idx];
                slot.client.next_req_frag = frag + 1;
                slot.client.in_wheel += 1;
                self.wheel.insert(
                    desired,
                    WheelEnt {
                        session_num,
                        slot_idx: slot_idx as u8,
                        seq: frag as u16,
                    },
                );
            } else {
                let slot = &mut sess.slots[slot_idx];
                slot.client.next_req_frag = frag + 1;
                let mut item = Self::data_frag_item(max_data, routing, remote_session, slot, frag);
                if self.faults.drop_data_pkt_once == Some((session_num, frag as u16)) {
                    item.drop = true;
                    self.faults.drop_data_pkt_once = None;
                }
                let idx = slot.client.num_tx % slot.client.tx_ts.len();
                slot.client.tx_ts[idx] = ev_tsc;
                slot.client.num_tx += 1;
                Self::push_tx(
                    &mut self.transport,
                    &mut self.tx_batch,
                    &mut self.dpath_stats,
                    item,
                );
            }
        }
    }

    /// Pull missing response fragments with RFRs as credits allow.
    fn kick_rfr(&mut self, session_num: u16, slot_idx: usize) {
        let pacing = self.pacing_enabled();
        let mtu = self.transport.mtu();
        loop {
            let ev_tsc = self.ev_loop_tsc;
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                return;
            };
            let routing = sess.remote_routing;
            let remote_session = sess.remote_session_num;

            let Some(frag) = sess.slots[slot_idx].next_unsent_rfr_frag() else {
                return;
            };
            if sess.credits == 0 {
                let slot = &mut sess.slots[slot_idx];
                if !slot.in_stallq {
                    slot.in_stallq = true;
                    self.stallq.push_back((session_num, slot_idx as u8));
                    self.dpath_stats.stall_events += 1;
                }
                return;
            }

            sess.credits -= 1;
            let slot = &mut sess.slots[slot_idx];
            slot.client.next_rfr_frag = frag + 1;
            if pacing {
                let spacing = sess.cc.pkt_spacing_tsc(mtu);
                let desired = sess.prev_desired_tx_tsc.max(ev_tsc) + spacing;
                sess.prev_desired_tx_tsc = desired;
                slot.client.in_wheel += 1;
                let req_pkts = slot.req_pkts() as u16;
                self.wheel.insert(
                    desired,
                    WheelEnt {
                        session_num,
                        slot_idx: slot_idx as u8,
                        // Marker for "request-for-response"; the fragment is
                        // re-chosen at dispatch time.
                        seq: req_pkts.max(1),
                    },
                );
            } else {
                let hdr = PktHdr::new(
                    slot.req_type,
                    0,
                    remote_session,
                    PktType::Rfr,
                    frag as u16,
                    slot.cur_req_num,
                );
                let idx = slot.client.num_tx % slot.client.tx_ts.len();
                slot.client.tx_ts[idx] = ev_tsc;
                slot.client.num_tx += 1;
                Self::push_tx(
                    &mut self.transport,
                    &mut self.tx_batch,
                    &mut self.dpath_stats,
                    TxBurstItem::control(routing, hdr),
                );
            }
        }
    }

    /// Resume whichever phase a slot is in.
    fn kick(&mut self, session_num: u16, slot_idx: usize) {
        let resp_known = self
            .sessions
            .get(session_num as usize)
            .map(|s| s.slots[slot_idx].client.resp_num_pkts > 0)
            .unwrap_or(false);
        if resp_known {
            self.kick_rfr(session_num, slot_idx);
        } else {
            self.kick_req(session_num, slot_idx);
        }
    }

    fn data_frag_item(
        max_data: usize,
        routing: RoutingInfo,
        remote_session: u16,
        slot: &SSlot,
        frag: usize,
    ) -> TxBurstItem {
        let mbuf = slot.tx_msgbuf.as_ref().unwrap();
        let msg_size = mbuf.data_size();
        let offset = frag * max_data;
        let len = max_data.min(msg_size - offset.min(msg_size));
        let hdr = PktHdr::new(
            slot.req_type,
            msg_size,
            remote_session,
            PktType::Req,
            frag as u16,
            slot.cur_req_num,
        );
        TxBurstItem {
            routing,
            hdr,
            payload: unsafe { mbuf.as_ptr().add(offset) },
            payload_len: len as u32,
            drop: false,
        }
    }

    fn push_tx(
        transport: &mut T,
        batch: &mut Vec<TxBurstItem>,
        stats: &mut DpathStats,
        item: TxBurstItem,
    ) {
        batch.push(item);
        stats.tx_pkts += 1;
        if batch.len() >= TX_BATCH_SIZE {
            Self::flush_batch(transport, batch);
        }
    }

    fn flush_batch(transport: &mut T, batch: &mut Vec<TxBurstItem>) {
        if !batch.is_empty() {
            transport.tx_burst(batch);
            batch.clear();
        }
    }

    /// Dispatch one wheel entry: move it from the wheel to the transmit
    /// batch. The entry already holds a credit; transmission is what
    /// advances `num_tx`.
    fn transmit_wheel_ent(&mut self, ent: WheelEnt) {
        let max_data = self.transport.max_data_per_pkt();
        let ev_tsc = self.ev_loop_tsc;
        let Some(sess) = self.sessions.get_mut(ent.session_num as usize) else {
            return;
        };
        let routing = sess.remote_routing;
        let remote_session = sess.remote_session_num;
        let slot = &mut sess.slots[ent.slot_idx as usize];
        slot.client.in_wheel = slot.client.in_wheel.saturating_sub(1);

        if slot.tx_msgbuf.is_none() {
            // Stale entry for a retired request; hand its credit back.
            sess.credits += 1;
            return;
        }

        let seq = ent.seq as usize;
        let req_pkts = slot.req_pkts();
        let item = if seq < req_pkts {
            let mut item = Self::data_frag_item(max_data, routing, remote_session, slot, seq);
            if self.faults.drop_data_pkt_once == Some((ent.session_num, ent.seq)) {
                item.drop = true;
                self.faults.drop_data_pkt_once = None;
            }
            Some(item)
        } else if slot.client.resp_num_pkts > 0 {
            let frag = slot
                .client
                .rx_bitmap
                .first_missing_from(slot.client.next_rfr_frag.max(1), slot.client.resp_num_pkts)
                .or_else(|| {
                    slot.client
                        .rx_bitmap
                        .first_missing_from(1, slot.client.resp_num_pkts)
                })
                .unwrap_or(slot.client.resp_num_pkts - 1);
            slot.client.next_rfr_frag = frag + 1;
            let hdr = PktHdr::new(
                slot.req_type,
                0,
                remote_session,
                PktType::Rfr,
                frag as u16,
                slot.cur_req_num,
            );
            Some(TxBurstItem::control(routing, hdr))
        } else {
            None
        };

        match item {
            Some(item) => {
                let idx = slot.client.num_tx % slot.client.tx_ts.len();
                slot.client.tx_ts[idx] = ev_tsc;
                slot.client.num_tx += 1;
                Self::push_tx(
                    &mut self.transport,
                    &mut self.tx_batch,
                    &mut self.dpath_stats,
                    item,
                );
            }
            None => {
                sess.credits += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Server response path
    // ------------------------------------------------------------------

    /// Queue a handler's response for transmission. Called by the runtime
    /// when a foreground handler returns, and from completion-queue drain
    /// for background handlers.
    pub fn enqueue_response(&mut self, mut handle: ReqHandle) {
        let resp_size = handle.resp_size;
        let resp_pkts = self.transport.data_size_to_num_pkts(resp_size);
        let max_data = self.transport.max_data_per_pkt();
        if resp_pkts > MAX_PKT_NUM as usize {
            log::error!("response of {resp_size} bytes spans too many packets; dropped");
            self.free_handle_bufs(handle);
            return;
        }

        // The session may have been reset, or the request superseded, while
        // the handler ran.
        let valid = self
            .sessions
            .get(handle.session_num as usize)
            .map(|sess| {
                sess.role == Role::Server
                    && sess.slots[handle.slot_idx as usize].cur_req_num == handle.req_num
            })
            .unwrap_or(false);
        if !valid {
            self.free_handle_bufs(handle);
            return;
        }

        if let Some(req) = handle.req_msgbuf.take() {
            self.alloc.free(req.into_raw());
        }
        let mut resp = handle.resp_msgbuf.take().unwrap();
        resp.set_size(resp_size, resp_pkts);

        let sess = self.sessions.get_mut(handle.session_num as usize).unwrap();
        let routing = sess.remote_routing;
        let remote_session = sess.remote_session_num;
        let slot = &mut sess.slots[handle.slot_idx as usize];
        slot.tx_msgbuf = Some(resp);
        slot.server.handler_pending = false;

        let item = Self::resp_frag_item(max_data, routing, remote_session, slot, 0);
        Self::push_tx(
            &mut self.transport,
            &mut self.tx_batch,
            &mut self.dpath_stats,
            item,
        );
    }

    fn resp_frag_item(
        max_data: usize,
        routing: RoutingInfo,
        remote_session: u16,
        slot: &SSlot,
        frag: usize,
    ) -> TxBurstItem {
        let mbuf = slot.tx_msgbuf.as_ref().unwrap();
        let msg_size = mbuf.data_size();
        let offset = frag * max_data;
        let len = max_data.min(msg_size - offset.min(msg_size));
        let hdr = PktHdr::new(
            slot.req_type,
            msg_size,
            remote_session,
            PktType::Resp,
            frag as u16,
            slot.cur_req_num,
        );
        TxBurstItem {
            routing,
            hdr,
            payload: unsafe { mbuf.as_ptr().add(offset) },
            payload_len: len as u32,
            drop: false,
        }
    }

    fn transmit_resp_frag(&mut self, session_num: u16, slot_idx: usize, frag: usize) {
        let max_data = self.transport.max_data_per_pkt();
        let Some(sess) = self.sessions.get_mut(session_num as usize) else {
            return;
        };
        let routing = sess.remote_routing;
        let remote_session = sess.remote_session_num;
        let slot = &sess.slots[slot_idx];
        let Some(mbuf) = slot.tx_msgbuf.as_ref() else {
            return;
        };
        if frag >= mbuf.num_pkts() {
            return;
        }
        let item = Self::resp_frag_item(max_data, routing, remote_session, slot, frag);
        Self::push_tx(
            &mut self.transport,
            &mut self.tx_batch,
            &mut self.dpath_stats,
            item,
        );
    }

    fn free_handle_bufs(&mut self, mut handle: ReqHandle) {
        if let Some(b) = handle.req_msgbuf.take() {
            self.alloc.free(b.into_raw());
        }
        if let Some(b) = handle.resp_msgbuf.take() {
            self.alloc.free(b.into_raw());
        }
    }

    // ------------------------------------------------------------------
    // RX path
    // ------------------------------------------------------------------

    fn process_rx_pkt(&mut self, idx: usize) {
        let mut scratch = std::mem::take(&mut self.rx_scratch);
        scratch.clear();
        scratch.extend_from_slice(self.transport.rx_pkt(idx));

        match PktHdr::from_bytes(&scratch) {
            Ok(hdr) => {
                self.dpath_stats.rx_pkts += 1;
                let payload = &scratch[PKT_HDR_SIZE..];
                match hdr.pkt_type() {
                    PktType::Req => self.process_req_pkt(&hdr, payload),
                    PktType::Resp => self.process_resp_pkt(&hdr, payload),
                    PktType::Rfr => self.process_rfr_pkt(&hdr),
                    PktType::ExplCr => self.process_expl_cr(&hdr),
                }
            }
            Err(_) => {
                self.dpath_stats.rx_drop_bad_hdr += 1;
                log::trace!("dropping packet with bad header");
            }
        }
        self.rx_scratch = scratch;
    }

    /// Server side: a request-data fragment.
    fn process_req_pkt(&mut self, hdr: &PktHdr, payload: &[u8]) {
        let session_num = hdr.dest_session_num();
        let max_data = self.transport.max_data_per_pkt();
        let msg_size = hdr.msg_size();
        let num_req_pkts = self.transport.data_size_to_num_pkts(msg_size);
        let req_num = hdr.req_num();
        let resp_cap = self.config.max_resp_data_size;

        let (outcome, slot_idx) = {
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                self.dpath_stats.rx_drop_unknown_session += 1;
                return;
            };
            if sess.role != Role::Server || !sess.is_connected() {
                self.dpath_stats.rx_drop_stale += 1;
                return;
            }
            let slot_idx = sess.slot_of(req_num);
            let routing = sess.remote_routing;
            let remote_session = sess.remote_session_num;
            let slot = &mut sess.slots[slot_idx];

            if req_num < slot.cur_req_num {
                self.dpath_stats.rx_drop_stale += 1;
                return;
            }

            if req_num > slot.cur_req_num {
                // New request reuses the slot; the cached response of the
                // previous one is released now.
                if let Some(old) = slot.tx_msgbuf.take() {
                    self.alloc.free(old.into_raw());
                }
                if let Some(old) = slot.rx_msgbuf.take() {
                    self.alloc.free(old.into_raw());
                }
                slot.cur_req_num = req_num;
                slot.req_type = hdr.req_type();
                slot.server.req_msg_size = msg_size;
                slot.server.num_req_pkts = num_req_pkts;
                slot.server.rx_bitmap.reset(num_req_pkts);
                slot.server.handler_pending = false;

                let Some(raw) = self.alloc.alloc(msg_size.max(1), &mut self.transport) else {
                    log::warn!("request of {msg_size} bytes: allocation failed, dropped");
                    return;
                };
                slot.rx_msgbuf = Some(MsgBuffer::from_raw(raw, msg_size, num_req_pkts));
            }

            let slot = &mut sess.slots[slot_idx];
            let complete_before = slot.server.num_req_pkts > 0
                && slot.server.rx_bitmap.num_set() == slot.server.num_req_pkts;

            let outcome = if complete_before {
                // Duplicate of a fully received request: the peer lost our
                // response or its first fragment.
                self.dpath_stats.rx_dup += 1;
                if slot.tx_msgbuf.is_some() {
                    ReqOutcome::ResendResp0
                } else {
                    // Handler still running; the response will go out soon.
                    ReqOutcome::Done
                }
            } else {
                let frag = hdr.pkt_num() as usize;
                if frag >= slot.server.num_req_pkts {
                    self.dpath_stats.rx_drop_bad_hdr += 1;
                    return;
                }
                let newly = slot.server.rx_bitmap.set(frag);
                if newly {
                    let offset = frag * max_data;
                    if let Some(rx) = slot.rx_msgbuf.as_mut() {
                        let n = payload.len().min(rx.data_size().saturating_sub(offset));
                        if n > 0 {
                            rx.data_mut()[offset..offset + n].copy_from_slice(&payload[..n]);
                        }
                    }
                } else {
                    self.dpath_stats.rx_dup += 1;
                }

                if slot.server.rx_bitmap.num_set() < slot.server.num_req_pkts {
                    // Request incomplete: no response is imminent, so the
                    // credit goes back explicitly. Duplicates get one too,
                    // which heals lost credit returns.
                    let cr = PktHdr::new(
                        slot.req_type,
                        0,
                        remote_session,
                        PktType::ExplCr,
                        frag as u16,
                        req_num,
                    );
                    Self::push_tx(
                        &mut self.transport,
                        &mut self.tx_batch,
                        &mut self.dpath_stats,
                        TxBurstItem::control(routing, cr),
                    );
                    ReqOutcome::Done
                } else {
                    // Final fragment: its credit rides on the first response
                    // packet.
                    let Some(req) = slot.rx_msgbuf.take() else {
                        // Reassembly buffer allocation failed earlier; the
                        // client's retransmission budget ends this request.
                        return;
                    };
                    let Some(raw) = self.alloc.alloc(resp_cap, &mut self.transport) else {
                        log::warn!("response buffer allocation failed; request dropped");
                        self.alloc.free(req.into_raw());
                        return;
                    };
                    let resp_pkts = resp_cap.div_ceil(max_data);
                    slot.server.handler_pending = true;
                    ReqOutcome::Invoke {
                        handle: ReqHandle {
                            session_num,
                            slot_idx: slot_idx as u8,
                            req_num,
                            req_type: slot.req_type,
                            req_msgbuf: Some(req),
                            resp_msgbuf: Some(MsgBuffer::from_raw(raw, resp_cap, resp_pkts)),
                            resp_size: 0,
                        },
                    }
                }
            };
            (outcome, slot_idx)
        };

        match outcome {
            ReqOutcome::Done => {}
            ReqOutcome::ResendResp0 => self.transmit_resp_frag(session_num, slot_idx, 0),
            ReqOutcome::Invoke { handle } => self.invoke_req_handler(handle),
        }
    }

    fn invoke_req_handler(&mut self, mut handle: ReqHandle) {
        let entry = self
            .req_handlers
            .get(handle.req_type as usize)
            .and_then(|e| e.as_ref())
            .cloned();
        match entry {
            Some(entry) => {
                if entry.kind == HandlerKind::Background && !self.bg_workers.is_empty() {
                    let n = self.bg_workers.len();
                    let worker = &mut self.bg_workers[self.bg_next % n];
                    self.bg_next = self.bg_next.wrapping_add(1);
                    match worker.work_tx.try_send(BgWorkItem::Request {
                        func: entry.func.clone(),
                        handle,
                    }) {
                        Ok(()) => {}
                        Err(e) => {
                            // Worker ring full: run inline rather than drop.
                            log::warn!("background ring full; running handler inline");
                            if let BgWorkItem::Request { func, mut handle } = e.into_inner() {
                                func(&mut handle);
                                self.enqueue_response(handle);
                            }
                        }
                    }
                } else {
                    (entry.func)(&mut handle);
                    self.enqueue_response(handle);
                }
            }
            None => {
                log::warn!("no handler for request type {}; dropped", handle.req_type);
                self.free_handle_bufs(handle);
            }
        }
    }

    /// Client side: a response-data fragment.
    fn process_resp_pkt(&mut self, hdr: &PktHdr, payload: &[u8]) {
        let session_num = hdr.dest_session_num();
        let max_data = self.transport.max_data_per_pkt();
        let msg_size = hdr.msg_size();
        let resp_num_pkts = self.transport.data_size_to_num_pkts(msg_size);
        let ev_tsc = self.ev_loop_tsc;
        let enable_cc = self.config.enable_cc;

        let outcome = {
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                self.dpath_stats.rx_drop_unknown_session += 1;
                return;
            };
            if sess.role != Role::Client {
                self.dpath_stats.rx_drop_stale += 1;
                return;
            }
            let slot_idx = sess.slot_of(hdr.req_num());
            let slot = &mut sess.slots[slot_idx];
            if slot.cur_req_num != hdr.req_num() || slot.tx_msgbuf.is_none() {
                self.dpath_stats.rx_drop_stale += 1;
                return;
            }

            // First fragment announces the response size, which must fit the
            // caller's declared buffer size.
            let mut too_small = false;
            if slot.client.resp_num_pkts == 0 {
                let rx = slot.rx_msgbuf.as_mut().unwrap();
                if msg_size > rx.data_size() {
                    too_small = true;
                } else {
                    rx.set_size(msg_size, resp_num_pkts);
                    slot.client.resp_msg_size = msg_size;
                    slot.client.resp_num_pkts = resp_num_pkts;
                    slot.client.rx_bitmap.reset(resp_num_pkts);
                    slot.client.next_rfr_frag = 1;
                }
            }

            if too_small {
                let needed = msg_size;
                let available = slot.rx_msgbuf.as_ref().unwrap().data_size();
                Self::retire_client_slot(
                    sess,
                    slot_idx,
                    Err(Error::MsgBufferTooSmall { needed, available }),
                )
            } else {
                // Matched acknowledgement: credit and progress. An ack
                // beyond the sent count would be an accounting violation;
                // duplicates that arrive with the window fully acked are
                // dropped before they can create one.
                if slot.client.num_rx >= slot.client.num_tx {
                    self.dpath_stats.rx_dup += 1;
                    return;
                }
                let rtt_idx = slot.client.num_rx % slot.client.tx_ts.len();
                let rtt = ev_tsc.saturating_sub(slot.client.tx_ts[rtt_idx]);
                slot.client.num_rx += 1;
                slot.client.progress_tsc = ev_tsc;
                sess.credits += 1;
                if enable_cc {
                    sess.cc.update(rtt);
                }

                let slot = &mut sess.slots[slot_idx];
                let frag = hdr.pkt_num() as usize;
                if frag < slot.client.resp_num_pkts {
                    if slot.client.rx_bitmap.set(frag) {
                        let offset = frag * max_data;
                        let rx = slot.rx_msgbuf.as_mut().unwrap();
                        let n = payload.len().min(rx.data_size().saturating_sub(offset));
                        if n > 0 {
                            rx.data_mut()[offset..offset + n].copy_from_slice(&payload[..n]);
                        }
                    } else {
                        self.dpath_stats.rx_dup += 1;
                    }
                }

                if slot.client.rx_bitmap.num_set() == slot.client.resp_num_pkts {
                    let bg = self
                        .req_handlers
                        .get(slot.req_type as usize)
                        .and_then(|e| e.as_ref())
                        .map(|e| e.kind == HandlerKind::Background)
                        .unwrap_or(false)
                        && !self.bg_workers.is_empty();
                    Self::complete_client_slot(sess, slot_idx, bg)
                } else {
                    RespOutcome::KickRfr { slot_idx }
                }
            }
        };

        self.apply_resp_outcome(session_num, outcome);
    }

    /// Retire a slot with an error before the response arrived. In-flight
    /// credits are reclaimed; late packets for this request will be stale.
    fn retire_client_slot(
        sess: &mut Session,
        slot_idx: usize,
        result: Result<()>,
    ) -> RespOutcome {
        let slot = &mut sess.slots[slot_idx];
        let delta = slot.client.num_tx - slot.client.num_rx;
        sess.credits += delta;
        let slot = &mut sess.slots[slot_idx];
        let req = slot.tx_msgbuf.take().unwrap();
        let resp = slot.rx_msgbuf.take().unwrap();
        let cont = slot.client.cont.take();
        let tag = slot.client.tag;
        sess.free_slots.push(slot_idx as u8);
        RespOutcome::CompleteFg {
            cont,
            ctx: ContCtx {
                req_msgbuf: req,
                resp_msgbuf: resp,
                result,
                tag,
            },
        }
    }

    /// Response fully received: release buffers and route the continuation.
    fn complete_client_slot(sess: &mut Session, slot_idx: usize, bg: bool) -> RespOutcome {
        let slot = &mut sess.slots[slot_idx];
        // Acks that can no longer arrive (lost credit returns) are
        // reclaimed here.
        let delta = slot.client.num_tx - slot.client.num_rx;
        sess.credits += delta;

        let slot = &mut sess.slots[slot_idx];
        let req = slot.tx_msgbuf.take().unwrap();
        let resp = slot.rx_msgbuf.take().unwrap();
        let cont = slot.client.cont.take();
        let tag = slot.client.tag;
        slot.client.num_retx = 0;

        let ctx = ContCtx {
            req_msgbuf: req,
            resp_msgbuf: resp,
            result: Ok(()),
            tag,
        };

        match (cont, bg) {
            (Some(cont), true) => {
                slot.client.bg_cont_pending = true;
                RespOutcome::CompleteBg {
                    cont,
                    ctx,
                    slot_idx: slot_idx as u8,
                }
            }
            (cont, _) => {
                sess.free_slots.push(slot_idx as u8);
                RespOutcome::CompleteFg { cont, ctx }
            }
        }
    }

    fn apply_resp_outcome(&mut self, session_num: u16, outcome: RespOutcome) {
        match outcome {
            RespOutcome::KickRfr { slot_idx } => self.kick_rfr(session_num, slot_idx),
            RespOutcome::CompleteFg { cont, ctx } => {
                if let Some(cont) = cont {
                    cont(ctx);
                }
            }
            RespOutcome::CompleteBg {
                cont,
                ctx,
                slot_idx,
            } => {
                let n = self.bg_workers.len();
                let worker = &mut self.bg_workers[self.bg_next % n];
                self.bg_next = self.bg_next.wrapping_add(1);
                match worker.work_tx.try_send(BgWorkItem::Continuation {
                    cont,
                    ctx,
                    session_num,
                    slot_idx,
                }) {
                    Ok(()) => {}
                    Err(e) => {
                        if let BgWorkItem::Continuation { cont, ctx, .. } = e.into_inner() {
                            cont(ctx);
                            self.release_bg_cont_slot(session_num, slot_idx);
                        }
                    }
                }
            }
        }
    }

    fn release_bg_cont_slot(&mut self, session_num: u16, slot_idx: u8) {
        if let Some(sess) = self.sessions.get_mut(session_num as usize) {
            let slot = &mut sess.slots[slot_idx as usize];
            if slot.client.bg_cont_pending {
                slot.client.bg_cont_pending = false;
                sess.free_slots.push(slot_idx);
            }
        }
    }

    /// Server side: a request-for-response pulls one fragment.
    fn process_rfr_pkt(&mut self, hdr: &PktHdr) {
        let session_num = hdr.dest_session_num();
        let Some(sess) = self.sessions.get(session_num as usize) else {
            self.dpath_stats.rx_drop_unknown_session += 1;
            return;
        };
        if sess.role != Role::Server {
            self.dpath_stats.rx_drop_stale += 1;
            return;
        }
        let slot_idx = sess.slot_of(hdr.req_num());
        let slot = &sess.slots[slot_idx];
        if slot.cur_req_num != hdr.req_num() || slot.tx_msgbuf.is_none() {
            self.dpath_stats.rx_drop_stale += 1;
            return;
        }
        self.transmit_resp_frag(session_num, slot_idx, hdr.pkt_num() as usize);
    }

    /// Client side: an explicit credit return for one request fragment.
    fn process_expl_cr(&mut self, hdr: &PktHdr) {
        let ev_tsc = self.ev_loop_tsc;
        let session_num = hdr.dest_session_num();
        let Some(sess) = self.sessions.get_mut(session_num as usize) else {
            self.dpath_stats.rx_drop_unknown_session += 1;
            return;
        };
        if sess.role != Role::Client {
            self.dpath_stats.rx_drop_stale += 1;
            return;
        }
        let slot_idx = sess.slot_of(hdr.req_num());
        let slot = &mut sess.slots[slot_idx];
        if slot.cur_req_num != hdr.req_num() || slot.tx_msgbuf.is_none() {
            self.dpath_stats.rx_drop_stale += 1;
            return;
        }
        if slot.client.num_rx >= slot.client.num_tx {
            self.dpath_stats.rx_dup += 1;
            return;
        }
        slot.client.num_rx += 1;
        slot.client.progress_tsc = ev_tsc;
        slot.client.req_ack_bitmap.set(hdr.pkt_num() as usize);
        sess.credits += 1;
    }

    // ------------------------------------------------------------------
    // Loss detection and retransmission
    // ------------------------------------------------------------------

    fn pkt_loss_scan(&mut self) {
        let mut expired: Vec<(u16, usize)> = Vec::new();
        for (num, sess) in self.sessions.iter() {
            if sess.role != Role::Client || sess.state != SessionState::Connected {
                continue;
            }
            for (i, slot) in sess.slots.iter().enumerate() {
                let outstanding = slot.tx_msgbuf.is_some() || slot.client.bg_cont_pending;
                if !outstanding || slot.client.num_tx == 0 {
                    continue;
                }
                if self.ev_loop_tsc.saturating_sub(slot.client.progress_tsc) > self.rto_cycles {
                    expired.push((num as u16, i));
                }
            }
        }
        for (sess_num, slot_idx) in expired {
            self.pkt_loss_retransmit(sess_num, slot_idx);
        }
    }

    fn pkt_loss_retransmit(&mut self, session_num: u16, slot_idx: usize) {
        enum Action {
            FalsePositive,
            Reset,
            Rollback { delta: usize },
        }

        let mtu = self.transport.mtu();
        let pacing = self.pacing_enabled();
        let max_retx = self.config.max_retransmissions;
        let ev_tsc = self.ev_loop_tsc;

        let action = {
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                return;
            };
            if sess.state != SessionState::Connected {
                return;
            }
            let slot = &mut sess.slots[slot_idx];
            let delta = slot.client.num_tx - slot.client.num_rx;
            log::debug!(
                "rpc {}: packet loss suspected on session {} req {}: num_tx {} num_rx {}",
                self.rpc_id,
                session_num,
                slot.cur_req_num,
                slot.client.num_tx,
                slot.client.num_rx,
            );

            if delta == 0 {
                // In-flight completion, a credit stall, a wheel-resident
                // packet, or a background-owned slot.
                Action::FalsePositive
            } else {
                slot.client.num_retx += 1;
                if slot.client.num_retx > max_retx {
                    Action::Reset
                } else {
                    // delta > 0 implies the slot cannot be credit-stalled.
                    debug_assert!(!slot.in_stallq);
                    sess.credits += delta;
                    let slot = &mut sess.slots[slot_idx];
                    slot.client.num_tx = slot.client.num_rx;
                    slot.client.progress_tsc = ev_tsc;
                    slot.client.next_req_frag = 0;
                    slot.client.next_rfr_frag = 1;
                    sess.cc.num_retransmissions += 1;
                    Action::Rollback { delta }
                }
            }
        };

        match action {
            Action::FalsePositive => {
                self.pkt_loss_stats.num_false_positives += 1;
                log::debug!("session {session_num}: false positive, ignoring");
            }
            Action::Reset => {
                log::warn!(
                    "session {session_num}: retransmission budget exhausted, resetting"
                );
                self.session_reset(session_num);
            }
            Action::Rollback { delta } => {
                self.pkt_loss_stats.num_retransmissions += 1;

                // Drain all queued packets and make the transport release
                // its send buffers before reposting any of them.
                Self::flush_batch(&mut self.transport, &mut self.tx_batch);
                self.transport.tx_flush();

                if pacing {
                    let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                        return;
                    };
                    // The wheel may still hold packets for this slot; they
                    // consumed credits without advancing num_tx, so extra
                    // copies on the wire are deduplicated by the peer.
                    let mut enqueued = 0;
                    for _ in 0..delta {
                        let slot = &mut sess.slots[slot_idx];
                        let seq = match slot.next_unsent_req_frag() {
                            Some(f) => {
                                slot.client.next_req_frag = f + 1;
                                f as u16
                            }
                            None if slot.client.resp_num_pkts > 0 => slot.req_pkts() as u16,
                            None => break,
                        };
                        let spacing = sess.cc.pkt_spacing_tsc(mtu);
                        let desired = sess.prev_desired_tx_tsc.max(ev_tsc) + spacing;
                        sess.prev_desired_tx_tsc = desired;
                        sess.slots[slot_idx].client.in_wheel += 1;
                        self.wheel.insert(
                            desired,
                            WheelEnt {
                                session_num,
                                slot_idx: slot_idx as u8,
                                seq,
                            },
                        );
                        enqueued += 1;
                    }
                    sess.credits -= enqueued;
                } else {
                    let req_pending = self
                        .sessions
                        .get(session_num as usize)
                        .map(|s| s.slots[slot_idx].client.resp_num_pkts == 0)
                        .unwrap_or(false);
                    if req_pending {
                        self.kick_req(session_num, slot_idx);
                    } else {
                        self.kick_rfr(session_num, slot_idx);
                    }
                }
            }
        }
    }

    /// Tear a session down after a fatal fault: every outstanding request
    /// fails through its continuation, then the sm handler hears about it.
    fn session_reset(&mut self, session_num: u16) {
        let mut conts: Vec<(Option<Continuation>, ContCtx)> = Vec::new();
        {
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                return;
            };
            sess.state = SessionState::ResetInProgress;
            self.wheel.purge_session(session_num);

            let role = sess.role;
            for slot in sess.slots.iter_mut() {
                slot.in_stallq = false;
                let tx = slot.tx_msgbuf.take();
                let rx = slot.rx_msgbuf.take();
                match (role, tx, rx) {
                    // A busy client slot holds both buffers; its issuer gets
                    // them back with the error.
                    (Role::Client, Some(req), Some(resp)) => {
                        let cont = slot.client.cont.take();
                        let tag = slot.client.tag;
                        conts.push((
                            cont,
                            ContCtx {
                                req_msgbuf: req,
                                resp_msgbuf: resp,
                                result: Err(Error::SessionReset),
                                tag,
                            },
                        ));
                    }
                    // Server buffers (partial requests, cached responses)
                    // were allocated here and return here.
                    (_, tx, rx) => {
                        if let Some(b) = tx {
                            self.alloc.free(b.into_raw());
                        }
                        if let Some(b) = rx {
                            self.alloc.free(b.into_raw());
                        }
                    }
                }
            }
        }
        self.stallq
            .retain(|&(s, _)| s != session_num);
        self.sessions.remove(session_num as usize);

        for (cont, ctx) in conts {
            match cont {
                Some(cont) => cont(ctx),
                None => {
                    self.alloc.free(ctx.req_msgbuf.into_raw());
                    self.alloc.free(ctx.resp_msgbuf.into_raw());
                }
            }
        }
        (self.sm_handler)(session_num, SmEvent::Reset, Some(Error::SessionReset));
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    fn drain_sm_inbox(&mut self) {
        let mut pkts = Vec::new();
        while let Ok(pkt) = self.sm_rx.try_recv() {
            pkts.push(pkt);
        }
        for pkt in pkts {
            self.handle_sm_pkt(pkt);
        }
    }

    fn handle_sm_pkt(&mut self, pkt: SmPkt) {
        if matches!(
            pkt.pkt_type,
            SmPktType::ConnectResp | SmPktType::DisconnectResp
        ) && self.faults.drop_sm_resp_once
        {
            self.faults.drop_sm_resp_once = false;
            log::debug!("dropping sm response (fault injection)");
            return;
        }

        match pkt.pkt_type {
            SmPktType::ConnectReq => self.handle_connect_req(pkt),
            SmPktType::ConnectResp => self.handle_connect_resp(pkt),
            SmPktType::DisconnectReq => self.handle_disconnect_req(pkt),
            SmPktType::DisconnectResp => self.handle_disconnect_resp(pkt),
            SmPktType::Reset => {
                // Peer declared the session dead.
                self.session_reset(pkt.client_session_num);
            }
        }
    }

    fn handle_connect_req(&mut self, pkt: SmPkt) {
        let mut resp = pkt.clone();
        resp.pkt_type = SmPktType::ConnectResp;
        resp.server_uri = self.nexus.local_uri().to_string();
        resp.server_routing = self.local_routing;

        // A retried handshake must get the same session, not a second one.
        let existing = self.sessions.iter().find_map(|(num, s)| {
            (s.role == Role::Server
                && s.uniq_token == pkt.uniq_token
                && s.remote_session_num == pkt.client_session_num
                && s.remote_uri == pkt.client_uri)
                .then_some(num as u16)
        });

        let err = if let Some(num) = existing {
            resp.server_session_num = num;
            SmErrCode::Ok
        } else if self.sessions.len() >= self.config.max_sessions {
            SmErrCode::NoFreeSessions
        } else {
            let mut routing = pkt.client_routing;
            if !self.transport.resolve_remote_routing_info(&mut routing) {
                SmErrCode::RoutingResolutionFailed
            } else {
                let entry = self.sessions.vacant_entry();
                let session_num = entry.key() as u16;
                let mut sess = Session::new(
                    Role::Server,
                    session_num,
                    pkt.client_uri.clone(),
                    pkt.client_rpc_id,
                    self.config.req_window,
                    self.config.session_credits,
                    Timely::new(self.config.link_bandwidth_gbps, self.freq_ghz),
                    pkt.uniq_token,
                );
                sess.remote_session_num = pkt.client_session_num;
                sess.remote_routing = routing;
                entry.insert(sess);
                resp.server_session_num = session_num;
                SmErrCode::Ok
            }
        };

        resp.err = err;
        if let Err(e) = self.nexus.sm_send(pkt.reply_uri(), &resp) {
            log::warn!("connect response to {} failed: {e}", pkt.reply_uri());
        }
    }

    fn handle_connect_resp(&mut self, pkt: SmPkt) {
        let session_num = pkt.client_session_num;
        let resolved = {
            let Some(sess) = self.sessions.get_mut(session_num as usize) else {
                return;
            };
            if sess.state != SessionState::ConnectInProgress || sess.uniq_token != pkt.uniq_token {
                return;
            }
            if pkt.err != SmErrCode::Ok {
                Err(Error::SessionConnectFailed("peer refused"))
            } else {
                let mut routing = pkt.server_routing;
                if self.transport.resolve_remote_routing_info(&mut routing) {
                    sess.remote_session_num = pkt.server_session_num;
                    sess.remote_routing = routing;
                    sess.state = SessionState::Connected;
                    Ok(())
                } else {
                    Err(Error::RoutingResolutionFailed)
                }
            }
        };

        match resolved {
            Ok(()) => (self.sm_handler)(session_num, SmEvent::ConnectSuccess, None),
            Err(err) => {
                self.sessions.remove(session_num as usize);
                (self.sm_handler)(session_num, SmEvent::ConnectFailed, Some(err));
            }
        }
    }

    fn handle_disconnect_req(&mut self, pkt: SmPkt) {
        let session_num = pkt.server_session_num;
        let known = {
            match self.sessions.get(session_num as usize) {
                Some(s) => s.role == Role::Server && s.uniq_token == pkt.uniq_token,
                None => true, // retried disconnect for an already-freed session
            }
        };
        if !known {
            return;
        }
        if let Some(mut sess) = self.sessions.try_remove(session_num as usize) {
            for slot in sess.slots.iter_mut() {
                if let Some(b) = slot.tx_msgbuf.take() {
                    self.alloc.free(b.into_raw());
                }
                if let Some(b) = slot.rx_msgbuf.take() {
                    self.alloc.free(b.into_raw());
                }
            }
            self.wheel.purge_session(session_num);
            (self.sm_handler)(session_num, SmEvent::Disconnected, None);
        }

        let mut resp = pkt.clone();
        resp.pkt_type = SmPktType::DisconnectResp;
        if let Err(e) = self.nexus.sm_send(pkt.reply_uri(), &resp) {
            log::warn!("disconnect response failed: {e}");
        }
    }

    fn handle_disconnect_resp(&mut self, pkt: SmPkt) {
        let session_num = pkt.client_session_num;
        let Some(sess) = self.sessions.get(session_num as usize) else {
            return;
        };
        if sess.state != SessionState::DisconnectInProgress {
            return;
        }
        self.sessions.remove(session_num as usize);
        self.wheel.purge_session(session_num);
        (self.sm_handler)(session_num, SmEvent::Disconnected, None);
    }

    /// Re-send session-management requests whose replies are overdue.
    fn sm_scan(&mut self) {
        let timeout_cycles = tsc::ms_to_cycles(self.config.sm_timeout_ms, self.freq_ghz);
        let now = rdtsc();
        let mut retries: Vec<(u16, SessionState)> = Vec::new();
        let mut failures: Vec<(u16, SessionState)> = Vec::new();

        for (num, sess) in self.sessions.iter_mut() {
            let in_progress = matches!(
                sess.state,
                SessionState::ConnectInProgress | SessionState::DisconnectInProgress
            );
            if !in_progress || now.saturating_sub(sess.sm_req_ts) <= timeout_cycles {
                continue;
            }
            sess.sm_retries += 1;
            if sess.sm_retries > self.config.sm_max_retries {
                failures.push((num as u16, sess.state));
            } else {
                retries.push((num as u16, sess.state));
            }
        }

        for (num, state) in retries {
            log::debug!("session {num}: sm timeout, retrying");
            let res = match state {
                SessionState::ConnectInProgress => self.send_connect_req(num),
                _ => self.send_disconnect_req(num),
            };
            if let Err(e) = res {
                log::warn!("sm retry for session {num} failed: {e}");
            }
        }

        for (num, state) in failures {
            self.sessions.remove(num as usize);
            match state {
                SessionState::ConnectInProgress => (self.sm_handler)(
                    num,
                    SmEvent::ConnectFailed,
                    Some(Error::SessionConnectFailed("no reply within retry budget")),
                ),
                _ => (self.sm_handler)(num, SmEvent::Disconnected, None),
            }
        }
    }

    // ------------------------------------------------------------------
    // Background completions
    // ------------------------------------------------------------------

    fn drain_bg_completions(&mut self) {
        let mut comps = Vec::new();
        for worker in &mut self.bg_workers {
            while let Ok(c) = worker.comp_rx.try_recv() {
                comps.push(c);
            }
        }
        for comp in comps {
            match comp {
                BgCompletion::Response { handle } => self.enqueue_response(handle),
                BgCompletion::ContDone {
                    session_num,
                    slot_idx,
                } => self.release_bg_cont_slot(session_num, slot_idx),
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Run one non-blocking dispatch iteration.
    pub fn run_event_loop_once(&mut self) -> Result<()> {
        self.ev_loop_tsc = rdtsc();

        if let Some(msg) = self.transport.fatal_fault() {
            return Err(Error::TransportFatal(msg));
        }

        self.drain_bg_completions();
        self.drain_sm_inbox();

        let n = self.transport.rx_burst();
        for i in 0..n {
            self.process_rx_pkt(i);
        }
        if n > 0 {
            self.transport.post_recvs(n);
        }

        // Credit-stalled slots whose sessions regained credits.
        for _ in 0..self.stallq.len() {
            let Some((sess_num, slot_idx)) = self.stallq.pop_front() else {
                break;
            };
            let Some(sess) = self.sessions.get_mut(sess_num as usize) else {
                continue;
            };
            sess.slots[slot_idx as usize].in_stallq = false;
            self.kick(sess_num, slot_idx as usize);
        }

        // Rate-paced packets whose dispatch time has come.
        let mut drain = std::mem::take(&mut self.wheel_drain);
        drain.clear();
        self.wheel.advance_into(self.ev_loop_tsc, &mut drain);
        for ent in drain.drain(..) {
            self.transmit_wheel_ent(ent);
        }
        self.wheel_drain = drain;

        Self::flush_batch(&mut self.transport, &mut self.tx_batch);

        if self.ev_loop_tsc.saturating_sub(self.last_pkt_loss_scan_tsc) > self.pkt_loss_scan_cycles
        {
            self.last_pkt_loss_scan_tsc = self.ev_loop_tsc;
            self.pkt_loss_scan();
        }
        if self.ev_loop_tsc.saturating_sub(self.last_sm_scan_tsc) > self.sm_scan_cycles {
            self.last_sm_scan_tsc = self.ev_loop_tsc;
            self.sm_scan();
        }

        Ok(())
    }

    /// Poll the dispatch loop for `duration_ms`.
    pub fn run_event_loop(&mut self, duration_ms: u64) -> Result<()> {
        let deadline = rdtsc() + tsc::ms_to_cycles(duration_ms, self.freq_ghz);
        while rdtsc() < deadline {
            self.run_event_loop_once()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Measured TSC frequency, for external time conversions.
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    pub fn pkt_loss_stats(&self) -> PktLossStats {
        self.pkt_loss_stats
    }

    pub fn dpath_stats(&self) -> DpathStats {
        self.dpath_stats
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, session_num: u16) -> Option<SessionState> {
        self.sessions.get(session_num as usize).map(|s| s.state)
    }

    pub fn session_credits(&self, session_num: u16) -> Option<usize> {
        self.sessions.get(session_num as usize).map(|s| s.credits)
    }

    /// `Σ (num_tx − num_rx)` across the session's slots.
    pub fn session_outstanding_pkts(&self, session_num: u16) -> Option<usize> {
        self.sessions
            .get(session_num as usize)
            .map(|s| s.outstanding_pkts())
    }

    pub fn session_sm_retries(&self, session_num: u16) -> Option<u32> {
        self.sessions.get(session_num as usize).map(|s| s.sm_retries)
    }

    pub fn stallq_len(&self) -> usize {
        self.stallq.len()
    }

    pub fn wheel_len(&self) -> usize {
        self.wheel.len()
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        Self::flush_batch(&mut self.transport, &mut self.tx_batch);
        self.transport.tx_flush();

        // Dropping the work producers tells workers to exit.
        self.bg_workers.clear();
        for h in std::mem::take(&mut self.bg_handles) {
            let _ = h.join();
        }

        self.alloc.dereg_all(&mut self.transport);
        self.nexus.unregister(self.rpc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::UdpTransport;

    fn test_rpc(rpc_id: u8) -> (Nexus, Rpc<UdpTransport>) {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let rpc = Rpc::new(
            &nexus,
            rpc_id,
            transport,
            RpcConfig::default(),
            Box::new(|_, _, _| {}),
        )
        .unwrap();
        (nexus, rpc)
    }

    #[test]
    fn msg_buffer_alloc_resize_free() {
        let (_nexus, mut rpc) = test_rpc(0);
        let mut mbuf = rpc.alloc_msg_buffer(3000).unwrap();
        assert_eq!(mbuf.data_size(), 3000);
        assert_eq!(mbuf.num_pkts(), 3); // 1024-byte MTU, 1008-byte payloads

        rpc.resize_msg_buffer(&mut mbuf, 100);
        assert_eq!(mbuf.data_size(), 100);
        assert_eq!(mbuf.num_pkts(), 1);

        rpc.free_msg_buffer(mbuf);
    }

    #[test]
    fn enqueue_on_unconnected_session_fails() {
        let (_nexus, mut rpc) = test_rpc(1);
        // The peer will never answer; the session stays ConnectInProgress.
        let session = rpc.create_session("127.0.0.1:9", 0).unwrap();
        assert_eq!(
            rpc.session_state(session),
            Some(SessionState::ConnectInProgress)
        );

        let req = rpc.alloc_msg_buffer(16).unwrap();
        let resp = rpc.alloc_msg_buffer(16).unwrap();
        let err = rpc
            .enqueue_request(session, 0, req, resp, Box::new(|_| {}), 0)
            .unwrap_err();
        assert!(matches!(err.error, Error::SessionConnectFailed(_)));
        // The buffers come back for reuse.
        rpc.free_msg_buffer(err.req_msgbuf);
        rpc.free_msg_buffer(err.resp_msgbuf);
    }

    #[test]
    fn duplicate_rpc_id_is_rejected() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let t1 = UdpTransport::bind("127.0.0.1:0").unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0").unwrap();
        let _a = Rpc::new(&nexus, 3, t1, RpcConfig::default(), Box::new(|_, _, _| {})).unwrap();
        assert!(Rpc::new(&nexus, 3, t2, RpcConfig::default(), Box::new(|_, _, _| {})).is_err());
    }

    #[test]
    fn config_validation() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let t = UdpTransport::bind("127.0.0.1:0").unwrap();
        let bad = RpcConfig::default().with_req_window(0);
        assert!(Rpc::new(&nexus, 0, t, bad, Box::new(|_, _, _| {})).is_err());
    }
}
