pub mod dtls;
pub mod ice;

use crate::rtp::is_rtp_payload_type;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// What a datagram on the shared media port carries, judged from its first
/// two bytes (RFC 7983).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    Dtls,
    Srtp,
    Srtcp,
    Unknown,
}

pub fn classify(data: &[u8]) -> PacketKind {
    let Some(&first) = data.first() else {
        return PacketKind::Unknown;
    };
    match first {
        20..=63 => PacketKind::Dtls,
        b if b & 0xC0 == 0 => PacketKind::Stun,
        b if b & 0xC0 == 0x80 => match data.get(1) {
            Some(&second) if is_rtp_payload_type(second) => PacketKind::Srtp,
            Some(_) => PacketKind::Srtcp,
            None => PacketKind::Unknown,
        },
        _ => PacketKind::Unknown,
    }
}

#[async_trait]
pub trait PacketReceiver: Send + Sync {
    async fn receive(&self, packet: Bytes, addr: SocketAddr);
}

/// Outbound half of the shared media socket.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, data, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Unreachable-network errors are routine for departed peers and only worth a
/// debug line; anything else is a local problem.
pub(crate) fn log_send_error(what: &str, addr: SocketAddr, err: &io::Error) {
    match err.kind() {
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            debug!("Failed to send {} to {}: {}", what, addr, err);
        }
        _ if err.raw_os_error() == Some(65) => {
            debug!("Failed to send {} to {}: {}", what, addr, err);
        }
        _ => warn!("Failed to send {} to {}: {}", what, addr, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_first_bytes() {
        assert_eq!(classify(&[0x00, 0x01]), PacketKind::Stun);
        assert_eq!(classify(&[0x01, 0x01]), PacketKind::Stun);
        assert_eq!(classify(&[22, 0xFE, 0xFD]), PacketKind::Dtls);
        assert_eq!(classify(&[20]), PacketKind::Dtls);
        assert_eq!(classify(&[63]), PacketKind::Dtls);
        assert_eq!(classify(&[0x80, 96]), PacketKind::Srtp);
        assert_eq!(classify(&[0x90, 0x80 | 111]), PacketKind::Srtp);
        assert_eq!(classify(&[0x80, 200]), PacketKind::Srtcp);
        assert_eq!(classify(&[0x81, 206]), PacketKind::Srtcp);
        assert_eq!(classify(&[0x80, 208]), PacketKind::Srtp);
        assert_eq!(classify(&[0x80]), PacketKind::Unknown);
        assert_eq!(classify(&[0x40, 0]), PacketKind::Unknown);
        assert_eq!(classify(&[0xC0, 0]), PacketKind::Unknown);
        assert_eq!(classify(&[]), PacketKind::Unknown);
    }
}
