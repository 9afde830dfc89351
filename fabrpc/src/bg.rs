//! Background worker threads.
//!
//! Long-running handlers and background-routed continuations run off the
//! dispatch thread. Work travels over per-worker SPSC rings: dispatch owns
//! the to-worker producer, each worker owns its completion producer, and no
//! locks are taken. Workers never touch transport, session or slot state;
//! everything they produce comes back as a completion record drained at the
//! head of the dispatch loop.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::nexus::{ReqHandle, ReqHandlerFn};
use crate::rpc::{ContCtx, Continuation};

/// Work-ring depth per worker.
const BG_RING_CAPACITY: usize = 256;

/// One unit of work handed to a worker.
pub(crate) enum BgWorkItem {
    /// Run a background request handler; the response comes back as a
    /// [`BgCompletion::Response`].
    Request {
        func: Arc<ReqHandlerFn>,
        handle: ReqHandle,
    },
    /// Run a background-routed continuation for a completed request.
    Continuation {
        cont: Continuation,
        ctx: ContCtx,
        session_num: u16,
        slot_idx: u8,
    },
}

/// Record published by a worker when an item finishes.
pub(crate) enum BgCompletion {
    /// A handler produced this response; dispatch enqueues it.
    Response { handle: ReqHandle },
    /// A continuation ran; dispatch releases the slot.
    ContDone { session_num: u16, slot_idx: u8 },
}

pub(crate) struct BgWorker {
    pub work_tx: spsc_ring::Producer<BgWorkItem>,
    pub comp_rx: spsc_ring::Consumer<BgCompletion>,
}

pub(crate) fn spawn_workers(n: usize) -> (Vec<BgWorker>, Vec<JoinHandle<()>>) {
    let mut workers = Vec::with_capacity(n);
    let mut handles = Vec::with_capacity(n);
    for id in 0..n {
        let (work_tx, work_rx) = spsc_ring::channel(BG_RING_CAPACITY);
        let (comp_tx, comp_rx) = spsc_ring::channel(BG_RING_CAPACITY);
        let handle = std::thread::Builder::new()
            .name(format!("fabrpc-bg-{id}"))
            .spawn(move || worker_main(work_rx, comp_tx))
            .expect("spawn background worker");
        workers.push(BgWorker { work_tx, comp_rx });
        handles.push(handle);
    }
    (workers, handles)
}

fn worker_main(
    mut work_rx: spsc_ring::Consumer<BgWorkItem>,
    mut comp_tx: spsc_ring::Producer<BgCompletion>,
) {
    loop {
        match work_rx.try_recv() {
            Ok(item) => {
                let completion = run_item(item);
                push_completion(&mut comp_tx, completion);
            }
            Err(spsc_ring::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_micros(20));
            }
            Err(spsc_ring::TryRecvError::Disconnected) => return,
        }
    }
}

fn run_item(item: BgWorkItem) -> BgCompletion {
    match item {
        BgWorkItem::Request { func, mut handle } => {
            func(&mut handle);
            BgCompletion::Response { handle }
        }
        BgWorkItem::Continuation {
            cont,
            ctx,
            session_num,
            slot_idx,
        } => {
            cont(ctx);
            BgCompletion::ContDone {
                session_num,
                slot_idx,
            }
        }
    }
}

fn push_completion(comp_tx: &mut spsc_ring::Producer<BgCompletion>, mut comp: BgCompletion) {
    loop {
        match comp_tx.try_send(comp) {
            Ok(()) => return,
            Err(spsc_ring::SendError::Full(c)) => {
                comp = c;
                std::thread::sleep(Duration::from_micros(20));
            }
            Err(spsc_ring::SendError::Disconnected(_)) => return,
        }
    }
}
