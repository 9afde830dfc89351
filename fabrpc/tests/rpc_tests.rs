//! End-to-end tests over the UDP transport: echo, fragmentation under loss,
//! credit stalls, false-positive retransmission, session-management retries
//! and session reset.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use common::{drive, drive_one, pair, SERVER_RPC_ID};
use fabrpc::{Error, HandlerKind, Nexus, RpcConfig, SmEvent};

const ECHO_REVERSED: u8 = 2;
const ECHO: u8 = 3;
const SLOW_TYPE: u8 = 7;

fn register_reverse_echo(calls: Arc<AtomicU64>) -> impl Fn(&Nexus) {
    move |nexus: &Nexus| {
        let calls = calls.clone();
        nexus.register_req_handler(ECHO_REVERSED, HandlerKind::Foreground, move |req| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut data = req.req_data().to_vec();
            data.reverse();
            req.resp_buf()[..data.len()].copy_from_slice(&data);
            req.set_resp_size(data.len());
        });
    }
}

fn register_echo(nexus: &Nexus) {
    nexus.register_req_handler(ECHO, HandlerKind::Foreground, |req| {
        let n = req.req_data().len();
        let data = req.req_data().to_vec();
        req.resp_buf()[..n].copy_from_slice(&data);
        req.set_resp_size(n);
    });
}

#[test]
fn echo_single_packet() {
    let calls = Arc::new(AtomicU64::new(0));
    let mut p = pair(
        RpcConfig::default(),
        RpcConfig::default(),
        1024,
        register_reverse_echo(calls.clone()),
    );
    let session = p.connect();

    let mut req = p.client.alloc_msg_buffer(16).unwrap();
    req.copy_from(b"0123456789abcdef");
    let resp = p.client.alloc_msg_buffer(16).unwrap();

    let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let result_cb = result.clone();
    p.client
        .enqueue_request(
            session,
            ECHO_REVERSED,
            req,
            resp,
            Box::new(move |ctx| {
                ctx.result.unwrap();
                *result_cb.lock().unwrap() = Some(ctx.resp_msgbuf.data().to_vec());
            }),
            0,
        )
        .unwrap();

    assert!(drive(&mut p, 5_000, |_| result.lock().unwrap().is_some()));
    assert_eq!(
        result.lock().unwrap().as_deref(),
        Some(&b"fedcba9876543210"[..])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.client.pkt_loss_stats().num_retransmissions, 0);
}

#[test]
fn multi_packet_request_survives_fragment_loss() {
    let calls = Arc::new(AtomicU64::new(0));
    let cfg = RpcConfig::default().with_rto_ms(20);
    let mut p = pair(cfg.clone(), cfg, 1024, register_reverse_echo(calls.clone()));
    let session = p.connect();

    // 3500 bytes over a 1024-byte MTU: four fragments.
    let payload: Vec<u8> = (0..3500u32).map(|i| (i % 251) as u8).collect();
    let mut req = p.client.alloc_msg_buffer(payload.len()).unwrap();
    req.copy_from(&payload);
    assert_eq!(req.num_pkts(), 4);
    let resp = p.client.alloc_msg_buffer(payload.len()).unwrap();

    // Fragment #2 vanishes on the wire, once.
    p.client.faults_mut().drop_data_pkt_once = Some((session, 2));

    let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let result_cb = result.clone();
    p.client
        .enqueue_request(
            session,
            ECHO_REVERSED,
            req,
            resp,
            Box::new(move |ctx| {
                ctx.result.unwrap();
                *result_cb.lock().unwrap() = Some(ctx.resp_msgbuf.data().to_vec());
            }),
            0,
        )
        .unwrap();

    assert!(drive(&mut p, 10_000, |_| result.lock().unwrap().is_some()));

    let mut expect = payload.clone();
    expect.reverse();
    assert_eq!(result.lock().unwrap().as_deref(), Some(&expect[..]));
    assert_eq!(p.client.pkt_loss_stats().num_retransmissions, 1);
    // One handler invocation despite the duplicate-free retransmission.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Retransmission drained the send queue the expensive way.
    assert!(p.client.transport().testing.tx_flush_count >= 1);
    assert_eq!(p.client.transport().testing.pkts_dropped, 1);
}

#[test]
fn credit_stall_bounds_inflight_packets() {
    // 16 slots against 8 credits: half the requests must stall.
    let cfg = RpcConfig::default()
        .with_req_window(16)
        .with_session_credits(8)
        .with_rto_ms(1000);
    let mut p = pair(cfg.clone(), cfg, 1024, register_echo);
    let session = p.connect();

    let completions = Arc::new(AtomicU64::new(0));
    for i in 0..16u64 {
        let req = {
            let mut b = p.client.alloc_msg_buffer(8).unwrap();
            b.copy_from(&i.to_le_bytes());
            b
        };
        let resp = p.client.alloc_msg_buffer(8).unwrap();
        let completions = completions.clone();
        p.client
            .enqueue_request(
                session,
                ECHO,
                req,
                resp,
                Box::new(move |ctx| {
                    ctx.result.unwrap();
                    completions.fetch_add(1, Ordering::SeqCst);
                }),
                i,
            )
            .unwrap();
    }

    // All slots taken now.
    let req = p.client.alloc_msg_buffer(8).unwrap();
    let resp = p.client.alloc_msg_buffer(8).unwrap();
    let err = p
        .client
        .enqueue_request(session, ECHO, req, resp, Box::new(|_| {}), 99)
        .unwrap_err();
    assert!(matches!(err.error, Error::TooManyOutstanding));

    let mut max_outstanding = 0;
    let ok = drive(&mut p, 10_000, |p| {
        let outstanding = p.client.session_outstanding_pkts(session).unwrap_or(0);
        let credits = p.client.session_credits(session).unwrap_or(0);
        max_outstanding = max_outstanding.max(outstanding);
        assert!(outstanding <= 8, "credit limit breached: {outstanding}");
        assert_eq!(credits + outstanding, 8, "credit conservation broken");
        completions.load(Ordering::SeqCst) == 16
    });
    assert!(ok, "not all requests completed");
    assert!(max_outstanding <= 8);
    assert!(
        p.client.dpath_stats().stall_events > 0,
        "stall queue never used"
    );
    assert_eq!(p.client.stallq_len(), 0);
}

#[test]
fn rto_on_completed_window_is_false_positive() {
    // A background continuation holds its slot while the RTO expires:
    // the scan must log a false positive and send nothing.
    let client_cfg = RpcConfig::default().with_rto_ms(5).with_bg_threads(1);
    let server_cfg = RpcConfig::default();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));

    let mut p = pair(client_cfg, server_cfg, 1024, |nexus| {
        nexus.register_req_handler(SLOW_TYPE, HandlerKind::Background, |req| {
            let n = req.req_data().len();
            let data = req.req_data().to_vec();
            req.resp_buf()[..n].copy_from_slice(&data);
            req.set_resp_size(n);
        });
    });
    let session = p.connect();

    let started = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let (started_cb, done_cb) = (started.clone(), done.clone());
    let release_rx_cb = release_rx.clone();

    let mut req = p.client.alloc_msg_buffer(8).unwrap();
    req.copy_from(b"blocking");
    let resp = p.client.alloc_msg_buffer(8).unwrap();
    p.client
        .enqueue_request(
            session,
            SLOW_TYPE,
            req,
            resp,
            Box::new(move |ctx| {
                ctx.result.unwrap();
                started_cb.store(true, Ordering::SeqCst);
                // Park on the worker until the test releases us.
                let _ = release_rx_cb
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10));
                done_cb.store(true, Ordering::SeqCst);
            }),
            0,
        )
        .unwrap();

    // Response received; the continuation is now parked on the worker.
    assert!(drive(&mut p, 5_000, |_| started.load(Ordering::SeqCst)));

    // Let the RTO expire and the scan run with the slot still bg-owned.
    std::thread::sleep(Duration::from_millis(30));
    let fp = drive_one(&mut p.client, 1_000, |c| {
        c.pkt_loss_stats().num_false_positives > 0
    });
    assert!(fp, "no false positive recorded");
    assert_eq!(p.client.pkt_loss_stats().num_retransmissions, 0);

    release_tx.send(()).unwrap();
    assert!(drive(&mut p, 5_000, |_| done.load(Ordering::SeqCst)));
}

#[test]
fn sm_retry_after_lost_connect_resp() {
    let cfg = RpcConfig::default()
        .with_sm_timeout_ms(50)
        .with_sm_max_retries(5);
    let mut p = pair(cfg.clone(), cfg, 1024, register_echo);

    // First connect response evaporates; the client must retry.
    p.client.faults_mut().drop_sm_resp_once = true;
    let server_uri = p.server_nexus.local_uri().to_string();
    let session = p.client.create_session(&server_uri, SERVER_RPC_ID).unwrap();

    let ok = drive(&mut p, 5_000, |p| {
        p.client.session_state(session) == Some(fabrpc::SessionState::Connected)
    });
    assert!(ok, "session never connected after sm retry");
    assert!(p.client.session_sm_retries(session).unwrap() >= 1);

    let events = p.client_events.lock().unwrap();
    let successes = events
        .iter()
        .filter(|(s, e, _)| *s == session && *e == SmEvent::ConnectSuccess)
        .count();
    assert_eq!(successes, 1);
    // The retried handshake reused the server-side session.
    assert_eq!(p.server.num_sessions(), 1);
}

#[test]
fn dead_peer_resets_session_and_fails_continuations() {
    let client_cfg = RpcConfig::default()
        .with_rto_ms(5)
        .with_max_retransmissions(2);
    let mut p = pair(client_cfg, RpcConfig::default(), 1024, register_echo);
    let session = p.connect();

    // Kill the peer endpoint; its nexus stays up but the datapath is gone.
    drop(p.server);

    let failed = Arc::new(Mutex::new(None::<String>));
    let failed_cb = failed.clone();
    let mut req = p.client.alloc_msg_buffer(8).unwrap();
    req.copy_from(b"doomed!!");
    let resp = p.client.alloc_msg_buffer(8).unwrap();
    p.client
        .enqueue_request(
            session,
            ECHO,
            req,
            resp,
            Box::new(move |ctx| {
                *failed_cb.lock().unwrap() = Some(match ctx.result {
                    Ok(()) => "unexpected success".to_string(),
                    Err(e) => e.to_string(),
                });
            }),
            0,
        )
        .unwrap();

    let ok = drive_one(&mut p.client, 10_000, |c| c.num_sessions() == 0);
    assert!(ok, "session was not torn down");

    assert_eq!(failed.lock().unwrap().as_deref(), Some("session reset"));
    let events = p.client_events.lock().unwrap();
    assert!(events
        .iter()
        .any(|(s, e, _)| *s == session && *e == SmEvent::Reset));
    assert_eq!(p.client.session_state(session), None);
}

#[test]
fn oversized_response_fails_via_continuation() {
    let mut p = pair(RpcConfig::default(), RpcConfig::default(), 1024, register_echo);
    let session = p.connect();

    // 100-byte echo into a buffer declared for 16 bytes.
    let mut req = p.client.alloc_msg_buffer(100).unwrap();
    req.copy_from(&[7u8; 100]);
    let resp = p.client.alloc_msg_buffer(16).unwrap();

    let outcome = Arc::new(Mutex::new(None::<String>));
    let outcome_cb = outcome.clone();
    p.client
        .enqueue_request(
            session,
            ECHO,
            req,
            resp,
            Box::new(move |ctx| {
                *outcome_cb.lock().unwrap() = Some(match ctx.result {
                    Ok(()) => "ok".into(),
                    Err(e) => e.to_string(),
                });
            }),
            0,
        )
        .unwrap();

    assert!(drive(&mut p, 5_000, |_| outcome.lock().unwrap().is_some()));
    let msg = outcome.lock().unwrap().take().unwrap();
    assert!(msg.contains("exceeds buffer"), "got: {msg}");
    // The slot is reusable afterwards.
    let req = p.client.alloc_msg_buffer(8).unwrap();
    let resp = p.client.alloc_msg_buffer(8).unwrap();
    assert!(p
        .client
        .enqueue_request(session, ECHO, req, resp, Box::new(|_| {}), 0)
        .is_ok());
}

#[test]
fn multi_packet_response_pulled_by_rfr() {
    let cfg = RpcConfig::default();
    let mut p = pair(cfg.clone(), cfg, 1024, register_echo);
    let session = p.connect();

    // Response spans four fragments; fragments 1..4 arrive only via RFRs.
    let payload: Vec<u8> = (0..3600u32).map(|i| (i % 239) as u8).collect();
    let mut req = p.client.alloc_msg_buffer(payload.len()).unwrap();
    req.copy_from(&payload);
    let resp = p.client.alloc_msg_buffer(payload.len()).unwrap();

    let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let result_cb = result.clone();
    p.client
        .enqueue_request(
            session,
            ECHO,
            req,
            resp,
            Box::new(move |ctx| {
                ctx.result.unwrap();
                *result_cb.lock().unwrap() = Some(ctx.resp_msgbuf.data().to_vec());
            }),
            0,
        )
        .unwrap();

    assert!(drive(&mut p, 10_000, |_| result.lock().unwrap().is_some()));
    assert_eq!(result.lock().unwrap().as_deref(), Some(&payload[..]));
    assert_eq!(p.client.pkt_loss_stats().num_retransmissions, 0);
    // Credits fully restored after the exchange.
    assert_eq!(p.client.session_credits(session), Some(8));
    assert_eq!(p.client.session_outstanding_pkts(session), Some(0));
}

#[test]
fn pipelined_requests_on_one_session() {
    let mut p = pair(RpcConfig::default(), RpcConfig::default(), 1024, register_echo);
    let session = p.connect();

    let completions = Arc::new(AtomicU64::new(0));
    for round in 0..4u64 {
        for i in 0..8u64 {
            let tag = round * 8 + i;
            let mut req = p.client.alloc_msg_buffer(16).unwrap();
            req.copy_from(&[tag as u8; 16]);
            let resp = p.client.alloc_msg_buffer(16).unwrap();
            let completions = completions.clone();
            p.client
                .enqueue_request(
                    session,
                    ECHO,
                    req,
                    resp,
                    Box::new(move |ctx| {
                        ctx.result.unwrap();
                        assert_eq!(ctx.resp_msgbuf.data(), &[ctx.tag as u8; 16][..]);
                        completions.fetch_add(1, Ordering::SeqCst);
                    }),
                    tag,
                )
                .unwrap();
        }
        let want = (round + 1) * 8;
        assert!(drive(&mut p, 5_000, |_| completions.load(Ordering::SeqCst)
            == want));
    }
    assert_eq!(completions.load(Ordering::SeqCst), 32);
    assert_eq!(p.client.pkt_loss_stats().num_retransmissions, 0);
}
