//! # fabrpc - microsecond-scale RPC over unreliable datagrams
//!
//! A user-space RPC runtime for lossless or near-lossless datacenter
//! fabrics. Sessions preserve the appearance of reliable, in-order delivery
//! per request over an unreliable datagram transport:
//!
//! - **Credit-based flow control**: a fixed credit pool per session bounds
//!   in-flight packets and prevents receiver buffer overrun.
//! - **Fragmentation and reassembly**: requests and responses span multiple
//!   self-describing MTU-sized fragments; reassembly is offset-indexed.
//! - **Loss recovery**: a periodic scan on the timestamp-counter clock rolls
//!   back and retransmits requests whose progress has stalled.
//! - **Rate pacing**: an optional Timely congestion controller spaces
//!   packets through a bucketed timing wheel.
//! - **Single-threaded dispatch**: one polling event loop per endpoint owns
//!   all session state; long handlers run on background workers that hand
//!   results back over SPSC rings.
//!
//! ## Usage
//!
//! ```no_run
//! use fabrpc::{HandlerKind, Nexus, Rpc, RpcConfig, UdpTransport};
//!
//! // Server process.
//! let nexus = Nexus::new("0.0.0.0:31850").unwrap();
//! nexus.register_req_handler(2, HandlerKind::Foreground, |req| {
//!     let n = req.req_data().len();
//!     let mut out: Vec<u8> = req.req_data().to_vec();
//!     out.reverse();
//!     req.resp_buf()[..n].copy_from_slice(&out);
//!     req.set_resp_size(n);
//! });
//!
//! let transport = UdpTransport::bind("0.0.0.0:0").unwrap();
//! let mut rpc = Rpc::new(
//!     &nexus,
//!     0,
//!     transport,
//!     RpcConfig::default(),
//!     Box::new(|session, event, err| {
//!         println!("session {session}: {event:?} ({err:?})");
//!     }),
//! )
//! .unwrap();
//!
//! loop {
//!     rpc.run_event_loop(1000).unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: endpoint configuration and protocol constants
//! - [`packet`]: the 16-byte wire packet header
//! - [`buffer`]: message buffers and the hugepage allocator
//! - [`transport`]: the transport capability set
//! - [`udp`]: a UDP datagram transport for development and tests
//! - [`session`]: sessions and session slots
//! - [`wheel`]: the pacing timing wheel
//! - [`cc`]: Timely congestion control
//! - [`sm`]: the session-management wire protocol
//! - [`nexus`]: process-wide registry and request handlers
//! - [`rpc`]: the endpoint and its dispatch loop

mod bg;
pub mod buffer;
pub mod cc;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod transport;
pub mod tsc;
pub mod udp;
pub mod wheel;

pub use buffer::MsgBuffer;
pub use config::{Faults, RpcConfig, DEFAULT_SM_PORT};
pub use error::{EnqueueError, Error, Result};
pub use nexus::{HandlerKind, Nexus, ReqHandle};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{ContCtx, Continuation, DpathStats, PktLossStats, Rpc, SmHandler};
pub use session::{Role, SessionState};
pub use sm::SmEvent;
pub use transport::{RoutingInfo, Transport, TxBurstItem};
pub use udp::UdpTransport;
