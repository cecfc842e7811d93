//! GTPv1-U basic header codec.
//!
//! Only the 8-byte basic header is supported: no extension headers, no
//! sequence numbers, no N-PDU numbers. The only message type the data
//! plane accepts is T-PDU (a G-PDU carrying a user IP packet).

use thiserror::Error;

/// Size of the GTPv1 basic header.
pub const GTP1_HDR_SIZE: usize = 8;

/// Flags byte for version 1, protocol type GTP, no optional headers.
pub const GTP1_FLAGS: u8 = 0x30;

/// Message type of a T-PDU (G-PDU).
pub const GTP1_MSGT_TPDU: u8 = 0xff;

/// Largest UDP payload the reader threads size their buffers for.
pub const MAX_UDP_PACKET: usize = 0xffff;

/// Header decode failures; each maps to a drop counter on the endpoint.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtpError {
    #[error("Short read: {0} < {GTP1_HDR_SIZE}")]
    TooShort(usize),

    #[error("Unexpected GTP flags: 0x{0:02x}")]
    BadFlags(u8),

    #[error("Unexpected GTP message type: 0x{0:02x}")]
    BadMessageType(u8),

    #[error("Truncated GTP message: length={claimed} but only {available} payload bytes")]
    Truncated { claimed: u16, available: usize },
}

/// Decoded basic header of a T-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp1Header {
    pub length: u16,
    pub teid: u32,
}

/// Validate a received datagram as a GTPv1 T-PDU.
///
/// Returns the header and the payload slice of exactly `length` bytes.
/// Trailing bytes beyond `length` are permitted and ignored.
pub fn parse_tpdu(datagram: &[u8]) -> Result<(Gtp1Header, &[u8]), GtpError> {
    if datagram.len() < GTP1_HDR_SIZE {
        return Err(GtpError::TooShort(datagram.len()));
    }
    if datagram[0] != GTP1_FLAGS {
        return Err(GtpError::BadFlags(datagram[0]));
    }
    if datagram[1] != GTP1_MSGT_TPDU {
        return Err(GtpError::BadMessageType(datagram[1]));
    }
    let length = u16::from_be_bytes([datagram[2], datagram[3]]);
    let available = datagram.len() - GTP1_HDR_SIZE;
    if usize::from(length) > available {
        return Err(GtpError::Truncated {
            claimed: length,
            available,
        });
    }
    let teid = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
    Ok((
        Gtp1Header { length, teid },
        &datagram[GTP1_HDR_SIZE..GTP1_HDR_SIZE + usize::from(length)],
    ))
}

/// Fill in a T-PDU header for `payload_len` bytes of user IP traffic.
pub fn write_tpdu_header(buf: &mut [u8], teid: u32, payload_len: u16) {
    buf[0] = GTP1_FLAGS;
    buf[1] = GTP1_MSGT_TPDU;
    buf[2..4].copy_from_slice(&payload_len.to_be_bytes());
    buf[4..8].copy_from_slice(&teid.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpdu(teid: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; GTP1_HDR_SIZE];
        write_tpdu_header(&mut out, teid, payload.len() as u16);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn roundtrip() {
        let payload = [0x45u8; 20];
        let datagram = tpdu(0x11111111, &payload);
        assert_eq!(
            &datagram[..8],
            &[0x30, 0xff, 0x00, 0x14, 0x11, 0x11, 0x11, 0x11]
        );
        let (hdr, body) = parse_tpdu(&datagram).unwrap();
        assert_eq!(hdr.teid, 0x11111111);
        assert_eq!(hdr.length, 20);
        assert_eq!(body, &payload);
    }

    #[test]
    fn short_datagram() {
        assert_eq!(parse_tpdu(&[0x30, 0xff, 0x00]), Err(GtpError::TooShort(3)));
    }

    #[test]
    fn bad_flags() {
        // Sequence number flag set
        let mut datagram = tpdu(1, &[]);
        datagram[0] = 0x32;
        assert_eq!(parse_tpdu(&datagram), Err(GtpError::BadFlags(0x32)));
    }

    #[test]
    fn non_tpdu_message() {
        // Echo Request
        let mut datagram = tpdu(1, &[]);
        datagram[1] = 0x01;
        assert_eq!(parse_tpdu(&datagram), Err(GtpError::BadMessageType(0x01)));
    }

    #[test]
    fn truncated_payload() {
        let mut datagram = tpdu(1, &[0u8; 4]);
        datagram[3] = 10; // claims more than present
        assert_eq!(
            parse_tpdu(&datagram),
            Err(GtpError::Truncated {
                claimed: 10,
                available: 4
            })
        );
    }

    #[test]
    fn length_equal_to_read_is_accepted() {
        let datagram = tpdu(7, &[1, 2, 3]);
        assert!(parse_tpdu(&datagram).is_ok());
    }

    #[test]
    fn trailing_bytes_ignored() {
        let mut datagram = tpdu(7, &[1, 2, 3]);
        datagram.extend_from_slice(&[9, 9]);
        let (hdr, body) = parse_tpdu(&datagram).unwrap();
        assert_eq!(hdr.length, 3);
        assert_eq!(body, &[1, 2, 3]);
    }
}
