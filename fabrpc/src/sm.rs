//! Session-management wire protocol.
//!
//! Session creation and teardown run out-of-band over UDP on a well-known
//! port. Reliability comes from client-side retransmission: the client
//! records when it sent a request and resends after `sm_timeout_ms` until
//! its retry budget runs out.

use crate::transport::{RoutingInfo, MAX_ROUTING_INFO_SIZE};

/// Fixed space for an endpoint URI ("host:port") on the wire.
pub const SM_URI_SIZE: usize = 64;

/// Serialized size of an [`SmPkt`].
pub const SM_PKT_SIZE: usize = 1 + 1 + 1 + 1 + 2 + 2 + 8 + 2 * SM_URI_SIZE + 2 * MAX_ROUTING_INFO_SIZE;

/// Session-management message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
    Reset = 4,
}

impl TryFrom<u8> for SmPktType {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(SmPktType::ConnectReq),
            1 => Ok(SmPktType::ConnectResp),
            2 => Ok(SmPktType::DisconnectReq),
            3 => Ok(SmPktType::DisconnectResp),
            4 => Ok(SmPktType::Reset),
            _ => Err(()),
        }
    }
}

/// Error code carried in session-management responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrCode {
    Ok = 0,
    /// Server could not resolve the client's routing info.
    RoutingResolutionFailed = 1,
    /// Server has no free session table entries.
    NoFreeSessions = 2,
    /// No endpoint with the requested rpc id.
    InvalidRpcId = 3,
}

impl TryFrom<u8> for SmErrCode {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(SmErrCode::Ok),
            1 => Ok(SmErrCode::RoutingResolutionFailed),
            2 => Ok(SmErrCode::NoFreeSessions),
            3 => Ok(SmErrCode::InvalidRpcId),
            _ => Err(()),
        }
    }
}

/// Session-management event delivered to the application's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    ConnectSuccess,
    ConnectFailed,
    Disconnected,
    Reset,
}

/// One session-management datagram.
#[derive(Debug, Clone)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err: SmErrCode,
    pub client_rpc_id: u8,
    pub server_rpc_id: u8,
    pub client_session_num: u16,
    pub server_session_num: u16,
    /// Distinguishes handshake retries from unrelated connect attempts.
    pub uniq_token: u64,
    pub client_uri: String,
    pub server_uri: String,
    pub client_routing: RoutingInfo,
    pub server_routing: RoutingInfo,
}

impl SmPkt {
    pub fn to_bytes(&self) -> [u8; SM_PKT_SIZE] {
        let mut b = [0u8; SM_PKT_SIZE];
        b[0] = self.pkt_type as u8;
        b[1] = self.err as u8;
        b[2] = self.client_rpc_id;
        b[3] = self.server_rpc_id;
        b[4..6].copy_from_slice(&self.client_session_num.to_le_bytes());
        b[6..8].copy_from_slice(&self.server_session_num.to_le_bytes());
        b[8..16].copy_from_slice(&self.uniq_token.to_le_bytes());

        let mut off = 16;
        write_uri(&mut b[off..off + SM_URI_SIZE], &self.client_uri);
        off += SM_URI_SIZE;
        write_uri(&mut b[off..off + SM_URI_SIZE], &self.server_uri);
        off += SM_URI_SIZE;
        b[off..off + MAX_ROUTING_INFO_SIZE].copy_from_slice(&self.client_routing.buf);
        off += MAX_ROUTING_INFO_SIZE;
        b[off..off + MAX_ROUTING_INFO_SIZE].copy_from_slice(&self.server_routing.buf);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < SM_PKT_SIZE {
            return None;
        }
        let pkt_type = SmPktType::try_from(b[0]).ok()?;
        let err = SmErrCode::try_from(b[1]).ok()?;

        let mut off = 16;
        let client_uri = read_uri(&b[off..off + SM_URI_SIZE])?;
        off += SM_URI_SIZE;
        let server_uri = read_uri(&b[off..off + SM_URI_SIZE])?;
        off += SM_URI_SIZE;
        let mut client_routing = RoutingInfo::default();
        client_routing
            .buf
            .copy_from_slice(&b[off..off + MAX_ROUTING_INFO_SIZE]);
        off += MAX_ROUTING_INFO_SIZE;
        let mut server_routing = RoutingInfo::default();
        server_routing
            .buf
            .copy_from_slice(&b[off..off + MAX_ROUTING_INFO_SIZE]);

        Some(Self {
            pkt_type,
            err,
            client_rpc_id: b[2],
            server_rpc_id: b[3],
            client_session_num: u16::from_le_bytes([b[4], b[5]]),
            server_session_num: u16::from_le_bytes([b[6], b[7]]),
            uniq_token: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            client_uri,
            server_uri,
            client_routing,
            server_routing,
        })
    }

    /// The rpc id of the endpoint this packet should be delivered to.
    pub fn dest_rpc_id(&self) -> u8 {
        match self.pkt_type {
            SmPktType::ConnectReq | SmPktType::DisconnectReq => self.server_rpc_id,
            _ => self.client_rpc_id,
        }
    }

    /// The URI the reply to this packet should go to.
    pub fn reply_uri(&self) -> &str {
        &self.client_uri
    }
}

fn write_uri(dst: &mut [u8], uri: &str) {
    let bytes = uri.as_bytes();
    let n = bytes.len().min(SM_URI_SIZE - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    // Remaining bytes stay zero; the first is the terminator.
}

fn read_uri(src: &[u8]) -> Option<String> {
    let end = src.iter().position(|&c| c == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SmPkt {
        let mut client_routing = RoutingInfo::default();
        client_routing.buf[0] = 4;
        SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrCode::Ok,
            client_rpc_id: 1,
            server_rpc_id: 2,
            client_session_num: 10,
            server_session_num: 0,
            uniq_token: 0xdead_beef,
            client_uri: "127.0.0.1:31850".to_string(),
            server_uri: "127.0.0.1:31851".to_string(),
            client_routing,
            server_routing: RoutingInfo::default(),
        }
    }

    #[test]
    fn wire_round_trip() {
        let pkt = sample();
        let bytes = pkt.to_bytes();
        let back = SmPkt::from_bytes(&bytes).unwrap();
        assert_eq!(back.pkt_type, pkt.pkt_type);
        assert_eq!(back.err, pkt.err);
        assert_eq!(back.client_session_num, 10);
        assert_eq!(back.uniq_token, 0xdead_beef);
        assert_eq!(back.client_uri, pkt.client_uri);
        assert_eq!(back.server_uri, pkt.server_uri);
        assert_eq!(back.client_routing.buf[0], 4);
    }

    #[test]
    fn requests_route_to_server_responses_to_client() {
        let mut pkt = sample();
        assert_eq!(pkt.dest_rpc_id(), 2);
        pkt.pkt_type = SmPktType::ConnectResp;
        assert_eq!(pkt.dest_rpc_id(), 1);
        pkt.pkt_type = SmPktType::Reset;
        assert_eq!(pkt.dest_rpc_id(), 1);
    }

    #[test]
    fn truncated_and_garbage_rejected() {
        let pkt = sample();
        let bytes = pkt.to_bytes();
        assert!(SmPkt::from_bytes(&bytes[..SM_PKT_SIZE - 1]).is_none());

        let mut bad = bytes;
        bad[0] = 0xff;
        assert!(SmPkt::from_bytes(&bad).is_none());
    }

    #[test]
    fn oversize_uri_is_truncated_not_panicking() {
        let mut pkt = sample();
        pkt.client_uri = "x".repeat(200);
        let back = SmPkt::from_bytes(&pkt.to_bytes()).unwrap();
        assert_eq!(back.client_uri.len(), SM_URI_SIZE - 1);
    }
}
