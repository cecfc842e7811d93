//! Decapsulation and encapsulation round-trips through a fake TUN.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use gtpud::daemon::Daemon;
use gtpud::endpoint::GtpEndpoint;
use gtpud::gtp;
use gtpud::test_util::{self, TunPeer, ipv4_packet};
use gtpud::tunnel::TunnelParams;

struct Setup {
    daemon: Arc<Daemon>,
    peer: TunPeer,
    local: SocketAddr,
    ep: Arc<GtpEndpoint>,
    /// Socket standing in for the remote GTP peer.
    remote_sock: UdpSocket,
}

/// One tunnel: rx 0x11111111, tx 0x22222222, user 10.0.0.1 on tun0.
fn setup() -> Setup {
    let daemon = Daemon::new();
    let peer = test_util::install_fake_tun(&daemon, "tun0").unwrap();
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let remote_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    remote_sock
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    daemon
        .tunnel_create(&TunnelParams {
            local,
            remote: remote_sock.local_addr().unwrap(),
            rx_teid: 0x11111111,
            tx_teid: 0x22222222,
            user_addr: "10.0.0.1".parse().unwrap(),
            tun_name: "tun0".to_string(),
            tun_netns: None,
        })
        .unwrap();

    let ep = daemon.find_endpoint(&local).unwrap();
    Setup {
        daemon,
        peer,
        local,
        ep,
        remote_sock,
    }
}

fn send_gtp(setup: &Setup, datagram: &[u8]) {
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(datagram, setup.ep.local_addr()).unwrap();
}

#[test]
fn decap_roundtrip() {
    let mut s = setup();

    // 8-byte header for TEID 0x11111111 plus a 20-byte IPv4 header.
    let payload = ipv4_packet("10.0.0.9".parse().unwrap(), "10.0.0.2".parse().unwrap(), &[]);
    let mut datagram = vec![0x30, 0xff, 0x00, 0x14, 0x11, 0x11, 0x11, 0x11];
    datagram.extend_from_slice(&payload);
    assert_eq!(datagram.len(), 28);

    send_gtp(&s, &datagram);
    let delivered = s.peer.recv_timeout(5000).expect("payload reaches the tun");
    assert_eq!(delivered, payload);

    // Tearing the tunnel down empties the registry and closes the
    // endpoint socket.
    s.daemon.tunnel_destroy(&s.local, 0x11111111).unwrap();
    assert_eq!(s.daemon.tunnel_count(), 0);
    assert_eq!(s.daemon.endpoint_count(), 0);
    assert_eq!(s.daemon.tun_count(), 0);
    let resolved = s.ep.local_addr();
    drop(s.ep);
    UdpSocket::bind(resolved).unwrap();
}

#[test]
fn encap_roundtrip() {
    let mut s = setup();

    let packet = ipv4_packet("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap(), &[]);
    s.peer.inject(&packet).unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = s.remote_sock.recv_from(&mut buf).unwrap();
    assert_eq!(n, 28);
    assert_eq!(&buf[..8], &[0x30, 0xff, 0x00, 0x14, 0x22, 0x22, 0x22, 0x22]);
    assert_eq!(&buf[8..28], packet.as_slice());
}

#[test]
fn encap_drops_unknown_user_address() {
    let mut s = setup();

    let stray = ipv4_packet("10.0.0.2".parse().unwrap(), "10.9.9.9".parse().unwrap(), &[]);
    s.peer.inject(&stray).unwrap();

    // A packet for a known user still goes through afterwards.
    let packet = ipv4_packet("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap(), &[7; 8]);
    s.peer.inject(&packet).unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = s.remote_sock.recv_from(&mut buf).unwrap();
    assert_eq!(n, 8 + packet.len());
    assert_eq!(&buf[8..n], packet.as_slice());

    let dev = s.daemon.find_tun("tun0", None).unwrap();
    assert_eq!(dev.no_tunnel_drops.load(Ordering::Relaxed), 1);
}

#[test]
fn decap_drops_unknown_teid() {
    let mut s = setup();

    let payload = ipv4_packet("10.0.0.9".parse().unwrap(), "10.0.0.2".parse().unwrap(), &[]);
    let mut datagram = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut datagram, 0x22222222, payload.len() as u16);
    datagram.extend_from_slice(&payload);
    send_gtp(&s, &datagram);

    assert!(s.peer.recv_timeout(200).is_none(), "unknown TEID must not be delivered");
    assert_eq!(s.ep.stats.unknown_teid.load(Ordering::Relaxed), 1);

    // The tunnel for the known TEID keeps working.
    let mut valid = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut valid, 0x11111111, payload.len() as u16);
    valid.extend_from_slice(&payload);
    send_gtp(&s, &valid);
    assert_eq!(s.peer.recv_timeout(5000).expect("valid TEID delivered"), payload);
}

#[test]
fn decap_drops_malformed_headers() {
    let mut s = setup();
    let payload = ipv4_packet("10.0.0.9".parse().unwrap(), "10.0.0.2".parse().unwrap(), &[]);

    // Shorter than the basic header.
    send_gtp(&s, &[0x30, 0xff, 0x00]);

    // Sequence-number flag set.
    let mut bad_flags = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut bad_flags, 0x11111111, 0);
    bad_flags[0] = 0x32;
    send_gtp(&s, &bad_flags);

    // Echo Request instead of T-PDU.
    let mut bad_type = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut bad_type, 0x11111111, 0);
    bad_type[1] = 0x01;
    send_gtp(&s, &bad_type);

    // Length field claims more than the datagram carries.
    let mut truncated = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut truncated, 0x11111111, 100);
    truncated.extend_from_slice(&[0u8; 4]);
    send_gtp(&s, &truncated);

    // A valid datagram sent last still arrives; loopback preserves
    // order, so the drops above have all been counted by then.
    let mut valid = vec![0u8; gtp::GTP1_HDR_SIZE];
    gtp::write_tpdu_header(&mut valid, 0x11111111, payload.len() as u16);
    valid.extend_from_slice(&payload);
    send_gtp(&s, &valid);
    assert_eq!(s.peer.recv_timeout(5000).expect("valid datagram delivered"), payload);

    assert_eq!(s.ep.stats.short_reads.load(Ordering::Relaxed), 1);
    assert_eq!(s.ep.stats.bad_flags.load(Ordering::Relaxed), 1);
    assert_eq!(s.ep.stats.bad_msg_type.load(Ordering::Relaxed), 1);
    assert_eq!(s.ep.stats.truncated.load(Ordering::Relaxed), 1);
}
