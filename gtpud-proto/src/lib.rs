//! Data model for the UECUPS control protocol.
//!
//! Every message is a single JSON document framed as one line on the
//! stream socket. A request is an object with exactly one key naming the
//! command; the daemon answers with a `<command>_res` object carrying a
//! textual result code, and may asynchronously emit `program_term_ind`
//! when a launched subprocess exits.
//!
//! IP addresses travel as hex-encoded network-byte-order strings next to
//! an `addr_type` discriminator. GTP endpoint addresses carry a `Port`
//! field; user addresses do not.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port of the daemon's control socket.
pub const UECUPS_DEFAULT_PORT: u16 = 4268;

/// Address decoding errors.
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("Invalid hex address: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("Address has {got} bytes, expected {expected}")]
    BadLength { got: usize, expected: usize },
}

/// Address family discriminator used throughout the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    #[serde(rename = "IPV4")]
    Ipv4,
    #[serde(rename = "IPV6")]
    Ipv6,
}

/// Decode a hex-encoded network-byte-order address of the given family.
pub fn decode_ip(addr_type: AddrType, ip_hex: &str) -> Result<IpAddr, AddrError> {
    let bytes = hex::decode(ip_hex)?;
    match addr_type {
        AddrType::Ipv4 => {
            let octets: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                AddrError::BadLength {
                    got: bytes.len(),
                    expected: 4,
                }
            })?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AddrType::Ipv6 => {
            let octets: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                AddrError::BadLength {
                    got: bytes.len(),
                    expected: 16,
                }
            })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Encode an address as (family tag, hex string) for the wire.
pub fn encode_ip(ip: &IpAddr) -> (AddrType, String) {
    match ip {
        IpAddr::V4(v4) => (AddrType::Ipv4, hex::encode(v4.octets())),
        IpAddr::V6(v6) => (AddrType::Ipv6, hex::encode(v6.octets())),
    }
}

/// A GTP endpoint address: `{"addr_type":"IPV4","ip":"7f000001","Port":2152}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtpEndpointAddr {
    pub addr_type: AddrType,
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

impl GtpEndpointAddr {
    pub fn to_socket_addr(&self) -> Result<SocketAddr, AddrError> {
        Ok(SocketAddr::new(decode_ip(self.addr_type, &self.ip)?, self.port))
    }
}

impl From<SocketAddr> for GtpEndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        let (addr_type, ip) = encode_ip(&addr.ip());
        Self {
            addr_type,
            ip,
            port: addr.port(),
        }
    }
}

/// Parameters of the `create_tun` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTun {
    pub local_gtp_ep: GtpEndpointAddr,
    pub remote_gtp_ep: GtpEndpointAddr,
    pub rx_teid: u32,
    pub tx_teid: u32,
    pub user_addr: String,
    pub user_addr_type: AddrType,
    pub tun_dev_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_netns_name: Option<String>,
}

impl CreateTun {
    /// The user-plane address carried by this request (portless).
    pub fn user_ip(&self) -> Result<IpAddr, AddrError> {
        decode_ip(self.user_addr_type, &self.user_addr)
    }
}

/// Parameters of the `destroy_tun` command; the pair is the tunnel key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyTun {
    pub local_gtp_ep: GtpEndpointAddr,
    pub rx_teid: u32,
}

/// Parameters of the `start_program` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProgram {
    pub run_as_user: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_netns_name: Option<String>,
}

/// A request, externally tagged by its command name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    #[serde(rename = "create_tun")]
    CreateTun(CreateTun),
    #[serde(rename = "destroy_tun")]
    DestroyTun(DestroyTun),
    #[serde(rename = "start_program")]
    StartProgram(StartProgram),
    #[serde(rename = "reset_all_state")]
    ResetAllState {},
}

impl Request {
    /// The command name, as it appears as the JSON key.
    pub fn command(&self) -> &'static str {
        match self {
            Request::CreateTun(_) => "create_tun",
            Request::DestroyTun(_) => "destroy_tun",
            Request::StartProgram(_) => "start_program",
            Request::ResetAllState {} => "reset_all_state",
        }
    }
}

/// Textual result codes carried by every `*_res` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERR_NOT_FOUND")]
    NotFound,
    #[serde(rename = "ERR_INVALID_DATA")]
    InvalidData,
}

/// Result object of `create_tun`, `destroy_tun` and `reset_all_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdResult {
    pub result: ResultCode,
}

/// Result object of `start_program`; `pid` is 0 when the spawn failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProgramRes {
    pub result: ResultCode,
    pub pid: i32,
}

/// Asynchronous notification about a tracked subprocess that exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramTermInd {
    pub pid: i32,
    pub exit_code: i32,
}

/// A daemon-to-client message, externally tagged like requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    #[serde(rename = "create_tun_res")]
    CreateTunRes(CmdResult),
    #[serde(rename = "destroy_tun_res")]
    DestroyTunRes(CmdResult),
    #[serde(rename = "start_program_res")]
    StartProgramRes(StartProgramRes),
    #[serde(rename = "reset_all_state_res")]
    ResetAllStateRes(CmdResult),
    #[serde(rename = "program_term_ind")]
    ProgramTermInd(ProgramTermInd),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_tun() {
        // Full create_tun document as a control plane emits it.
        let raw = r#"{"create_tun":{"tx_teid":1234,"rx_teid":5678,"user_addr_type":"IPV4","user_addr":"21222324","local_gtp_ep":{"addr_type":"IPV4","ip":"31323334","Port":2152},"remote_gtp_ep":{"addr_type":"IPV4","ip":"41424344","Port":2152},"tun_dev_name":"tun23","tun_netns_name":"foo"}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        let Request::CreateTun(ctun) = req else {
            panic!("wrong variant");
        };
        assert_eq!(ctun.tx_teid, 1234);
        assert_eq!(ctun.rx_teid, 5678);
        assert_eq!(ctun.user_ip().unwrap(), "33.34.35.36".parse::<IpAddr>().unwrap());
        assert_eq!(
            ctun.local_gtp_ep.to_socket_addr().unwrap(),
            "49.50.51.52:2152".parse().unwrap()
        );
        assert_eq!(ctun.tun_dev_name, "tun23");
        assert_eq!(ctun.tun_netns_name.as_deref(), Some("foo"));
    }

    #[test]
    fn parse_create_tun_without_netns() {
        let raw = r#"{"create_tun":{"tx_teid":1,"rx_teid":2,"user_addr_type":"IPV6","user_addr":"20010db8000000000000000000000001","local_gtp_ep":{"addr_type":"IPV4","ip":"7f000001","Port":2152},"remote_gtp_ep":{"addr_type":"IPV4","ip":"7f000002","Port":2152},"tun_dev_name":"tun0"}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        let Request::CreateTun(ctun) = req else {
            panic!("wrong variant");
        };
        assert!(ctun.tun_netns_name.is_none());
        assert_eq!(ctun.user_ip().unwrap(), "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_reset_all_state() {
        let req: Request = serde_json::from_str(r#"{"reset_all_state":{}}"#).unwrap();
        assert_eq!(req.command(), "reset_all_state");
    }

    #[test]
    fn parse_start_program() {
        let raw = r#"{"start_program":{"run_as_user":"nobody","command":"ping -c 1 10.0.0.1","environment":["FOO=bar"],"tun_netns_name":"ns1"}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        let Request::StartProgram(sp) = req else {
            panic!("wrong variant");
        };
        assert_eq!(sp.run_as_user, "nobody");
        assert_eq!(sp.environment, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn reject_wrong_address_length() {
        // 4-byte address tagged IPV6 must not decode.
        assert!(decode_ip(AddrType::Ipv6, "7f000001").is_err());
        assert!(decode_ip(AddrType::Ipv4, "20010db8000000000000000000000001").is_err());
        assert!(decode_ip(AddrType::Ipv4, "zzzz").is_err());
    }

    #[test]
    fn endpoint_addr_roundtrip() {
        let sa: SocketAddr = "[2001:db8::42]:2152".parse().unwrap();
        let ep = GtpEndpointAddr::from(sa);
        assert_eq!(ep.addr_type, AddrType::Ipv6);
        assert_eq!(ep.to_socket_addr().unwrap(), sa);
    }

    #[test]
    fn serialize_response() {
        let res = Response::CreateTunRes(CmdResult {
            result: ResultCode::Ok,
        });
        let js = serde_json::to_string(&res).unwrap();
        assert_eq!(js, r#"{"create_tun_res":{"result":"OK"}}"#);

        let ind = Response::ProgramTermInd(ProgramTermInd {
            pid: 1234,
            exit_code: 0,
        });
        let js = serde_json::to_string(&ind).unwrap();
        assert_eq!(js, r#"{"program_term_ind":{"pid":1234,"exit_code":0}}"#);
    }
}
