//! Runtime configuration.

/// Default UDP port for the session-management plane.
pub const DEFAULT_SM_PORT: u16 = 31850;

/// Interval between datapath packet-loss scans, in milliseconds.
pub const PKT_LOSS_SCAN_INTERVAL_MS: u64 = 10;

/// Interval between session-management retry scans, in milliseconds.
pub const SM_SCAN_INTERVAL_MS: u64 = 50;

/// Endpoint configuration.
///
/// Controls request multiplexing, flow control, reliability and pacing.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Concurrent requests per session (session slots).
    /// Default: 8
    pub req_window: usize,
    /// Flow-control credits per session. A credit authorizes one in-flight
    /// packet.
    /// Default: 8
    pub session_credits: usize,
    /// Retransmission timeout in milliseconds.
    /// Default: 5
    pub rto_ms: u64,
    /// Datapath retransmissions per request before the session is reset.
    /// Default: 5
    pub max_retransmissions: u32,
    /// Session-management retry timeout in milliseconds.
    /// Default: 1000
    pub sm_timeout_ms: u64,
    /// Session-management retries before giving up on a peer.
    /// Default: 3
    pub sm_max_retries: u32,
    /// Enable Timely congestion control and rate-paced injection through the
    /// timing wheel.
    /// Default: false
    pub enable_cc: bool,
    /// Link bandwidth in Gbit/s, the pacing rate ceiling.
    /// Default: 10.0
    pub link_bandwidth_gbps: f64,
    /// Background worker threads for long-running handlers.
    /// Default: 0
    pub num_bg_threads: usize,
    /// Maximum sessions per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Capacity of a pre-allocated response buffer handed to request
    /// handlers, in data bytes.
    /// Default: 32768
    pub max_resp_data_size: usize,
    /// Timing-wheel bucket count.
    /// Default: 4096
    pub wheel_num_buckets: usize,
    /// Timing-wheel bucket width in nanoseconds.
    /// Default: 100
    pub wheel_bucket_width_ns: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 8,
            rto_ms: 5,
            max_retransmissions: 5,
            sm_timeout_ms: 1000,
            sm_max_retries: 3,
            enable_cc: false,
            link_bandwidth_gbps: 10.0,
            num_bg_threads: 0,
            max_sessions: 256,
            max_resp_data_size: 32768,
            wheel_num_buckets: 4096,
            wheel_bucket_width_ns: 100,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-session request window.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    /// Set the per-session credit count.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the retransmission timeout.
    pub fn with_rto_ms(mut self, rto_ms: u64) -> Self {
        self.rto_ms = rto_ms;
        self
    }

    /// Set the datapath retransmission budget.
    pub fn with_max_retransmissions(mut self, n: u32) -> Self {
        self.max_retransmissions = n;
        self
    }

    /// Set the session-management retry timeout.
    pub fn with_sm_timeout_ms(mut self, ms: u64) -> Self {
        self.sm_timeout_ms = ms;
        self
    }

    /// Set the session-management retry budget.
    pub fn with_sm_max_retries(mut self, n: u32) -> Self {
        self.sm_max_retries = n;
        self
    }

    /// Enable or disable congestion control.
    pub fn with_cc(mut self, enable_cc: bool) -> Self {
        self.enable_cc = enable_cc;
        self
    }

    /// Set the number of background worker threads.
    pub fn with_bg_threads(mut self, n: usize) -> Self {
        self.num_bg_threads = n;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }
}

/// Test-only fault injection, compiled in unconditionally and off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Short-circuit the timing wheel even when pacing is enabled.
    pub hard_wheel_bypass: bool,
    /// Drop the next matching data packet on the wire, once.
    /// `(session_num, tx seq)` of the packet to drop.
    pub drop_data_pkt_once: Option<(u16, u16)>,
    /// Drop the next inbound session-management response, once.
    pub drop_sm_resp_once: bool,
}
