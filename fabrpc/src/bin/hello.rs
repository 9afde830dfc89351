//! Hello-world echo pair.
//!
//! Run the server, then the client:
//! ```bash
//! hello --role server --sm-uri 127.0.0.1:31850
//! hello --role client --sm-uri 127.0.0.1:31851 --server-uri 127.0.0.1:31850
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use minstant::Instant;

use fabrpc::{HandlerKind, Nexus, Rpc, RpcConfig, SmEvent, UdpTransport};

const REQ_TYPE: u8 = 2;
const MSG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Server,
    Client,
}

#[derive(Parser, Debug)]
#[command(about = "fabrpc hello-world echo")]
struct Args {
    #[arg(long, value_enum)]
    role: Role,

    /// Local session-management URI.
    #[arg(long, default_value = "127.0.0.1:31850")]
    sm_uri: String,

    /// Server session-management URI (client only).
    #[arg(long, default_value = "127.0.0.1:31850")]
    server_uri: String,

    /// Core to pin the dispatch thread to.
    #[arg(long, default_value_t = 0)]
    core: usize,
}

fn pin_to_core(core: usize) {
    if let Some(ids) = core_affinity::get_core_ids() {
        if let Some(id) = ids.into_iter().find(|c| c.id == core) {
            core_affinity::set_for_current(id);
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    pin_to_core(args.core);

    match args.role {
        Role::Server => run_server(&args),
        Role::Client => run_client(&args),
    }
}

fn run_server(args: &Args) {
    let nexus = Nexus::new(&args.sm_uri).expect("bind sm socket");
    nexus.register_req_handler(REQ_TYPE, HandlerKind::Foreground, |req| {
        let n = req.req_data().len();
        let mut data = req.req_data().to_vec();
        data.reverse();
        req.resp_buf()[..n].copy_from_slice(&data);
        req.set_resp_size(n);
    });

    let transport = UdpTransport::bind("0.0.0.0:0").expect("bind data socket");
    let mut rpc = Rpc::new(
        &nexus,
        0,
        transport,
        RpcConfig::default(),
        Box::new(|session, event, _err| {
            println!("session {session}: {event:?}");
        }),
    )
    .expect("create endpoint");

    println!("server listening on {}", nexus.local_uri());
    loop {
        rpc.run_event_loop(1000).expect("event loop");
    }
}

fn run_client(args: &Args) {
    let nexus = Nexus::new(&args.sm_uri).expect("bind sm socket");
    let transport = UdpTransport::bind("0.0.0.0:0").expect("bind data socket");

    let connected = Arc::new(AtomicBool::new(false));
    let connected_cb = connected.clone();
    let mut rpc = Rpc::new(
        &nexus,
        1,
        transport,
        RpcConfig::default(),
        Box::new(move |session, event, err| {
            println!("session {session}: {event:?} ({err:?})");
            if event == SmEvent::ConnectSuccess {
                connected_cb.store(true, Ordering::Release);
            }
        }),
    )
    .expect("create endpoint");

    let session = rpc
        .create_session(&args.server_uri, 0)
        .expect("create session");
    while !connected.load(Ordering::Acquire) {
        rpc.run_event_loop_once().expect("event loop");
    }

    let mut req = rpc.alloc_msg_buffer(MSG_SIZE).expect("alloc request");
    req.data_mut().copy_from_slice(b"hello, fabrpc!!!");
    let resp = rpc.alloc_msg_buffer(MSG_SIZE).expect("alloc response");

    let done = Arc::new(AtomicBool::new(false));
    let done_cb = done.clone();
    let start = Instant::now();
    rpc.enqueue_request(
        session,
        REQ_TYPE,
        req,
        resp,
        Box::new(move |ctx| {
            ctx.result.expect("rpc failed");
            println!(
                "response: {:?}",
                String::from_utf8_lossy(ctx.resp_msgbuf.data())
            );
            done_cb.store(true, Ordering::Release);
        }),
        0,
    )
    .expect("enqueue request");

    while !done.load(Ordering::Acquire) {
        rpc.run_event_loop_once().expect("event loop");
    }
    println!("round trip: {:.1} us", start.elapsed().as_nanos() as f64 / 1e3);
}
