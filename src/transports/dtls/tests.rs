use super::*;
use crate::rtp::{RtpHeader, RtpPacket};
use crate::transports::PacketReceiver;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UdpSocket;

fn test_config() -> Result<DtlsConfig> {
    let mut config = DtlsConfig::new(generate_certificate()?);
    config.handshake_timeout = Duration::from_secs(10);
    config.receive_timeout = Duration::from_secs(5);
    Ok(config)
}

/// Feeds every datagram arriving on `socket` into `association`.
fn pump(socket: Arc<UdpSocket>, association: DtlsAssociation) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, addr)) = socket.recv_from(&mut buf).await {
            association
                .receive(Bytes::copy_from_slice(&buf[..len]), addr)
                .await;
        }
    });
}

async fn wait_connected(association: &DtlsAssociation) -> Result<Arc<SrtpSession>> {
    let mut rx = association.subscribe_state();
    let state = timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| !matches!(s, DtlsState::New | DtlsState::Handshaking)),
    )
    .await??
    .clone();
    match state {
        DtlsState::Connected(session) => Ok(session),
        other => bail!("association ended in {other}"),
    }
}

#[test]
fn fingerprint_is_colon_separated_sha256() -> Result<()> {
    let cert = generate_certificate()?;
    let fp = fingerprint(&cert);
    assert_eq!(fp.len(), 32 * 3 - 1);
    assert!(fp.split(':').all(|b| {
        b.len() == 2 && b.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
    }));
    assert_eq!(fp, fingerprint(&cert));
    assert_ne!(fp, fingerprint(&generate_certificate()?));
    Ok(())
}

#[test]
fn state_equality_compares_sessions_by_identity() -> Result<()> {
    let profile = SrtpProfile::Aes128CmHmacSha1_80;
    let session = Arc::new(SrtpSession::from_exported(profile, &[7u8; 60], false)?);
    let twin = Arc::new(SrtpSession::from_exported(profile, &[7u8; 60], false)?);
    let a = DtlsState::Connected(session.clone());
    assert_eq!(a, DtlsState::Connected(session));
    assert_ne!(a, DtlsState::Connected(twin));
    assert_eq!(DtlsState::Failed, DtlsState::Failed);
    assert_ne!(DtlsState::New, DtlsState::Handshaking);
    Ok(())
}

#[tokio::test]
async fn shim_rejects_records_larger_than_the_buffer() -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = socket.local_addr()?;
    let shim = DatagramShim::new(local, local, socket, 4, Duration::from_millis(200));

    assert!(shim.offer(Bytes::from_static(&[22; 32])));
    let mut small = [0u8; 16];
    assert!(Conn::recv(&shim, &mut small).await.is_err());

    assert!(shim.offer(Bytes::from_static(&[22; 8])));
    let (n, from) = shim.recv_from(&mut small).await?;
    assert_eq!(n, 8);
    assert_eq!(from, local);
    Ok(())
}

#[tokio::test]
async fn shim_times_out_before_handshake_and_stops_after_close() -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = socket.local_addr()?;
    let shim = DatagramShim::new(local, local, socket, 2, Duration::from_millis(50));
    let mut buf = [0u8; 64];

    assert!(Conn::recv(&shim, &mut buf).await.is_err());

    assert!(shim.offer(Bytes::from_static(&[22; 4])));
    assert!(shim.offer(Bytes::from_static(&[22; 4])));
    // bounded queue
    assert!(!shim.offer(Bytes::from_static(&[22; 4])));

    DatagramShim::close(&shim);
    assert!(!shim.offer(Bytes::from_static(&[22; 4])));
    assert!(Conn::recv(&shim, &mut buf).await.is_err());
    assert!(Conn::send(&shim, &[1, 2, 3]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn handshake_exports_matching_srtp_keys() -> Result<()> {
    let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let client_addr = client_socket.local_addr()?;
    let server_addr = server_socket.local_addr()?;

    let server = DtlsAssociation::new(
        test_config()?,
        server_socket.clone(),
        server_addr,
        client_addr,
        false,
    );
    let client = DtlsAssociation::new(
        test_config()?,
        client_socket.clone(),
        client_addr,
        server_addr,
        true,
    );
    assert_eq!(server.state(), DtlsState::New);

    pump(server_socket, server.clone());
    pump(client_socket, client.clone());
    client.start();

    let (server_session, client_session) =
        tokio::try_join!(wait_connected(&server), wait_connected(&client))?;
    assert_eq!(server_session.profile(), SrtpProfile::Aes128CmHmacSha1_80);
    assert_eq!(client_session.profile(), server_session.profile());
    assert!(server.srtp_session().is_some());

    let packet = RtpPacket::new(RtpHeader::new(96, 1, 3000, 0x1122_3344), vec![0xAB; 40]);
    let mut wire = packet.marshal()?;
    client_session.protect_rtp(&mut wire)?;
    server_session.unprotect_rtp(&mut wire)?;
    assert_eq!(RtpPacket::parse(&wire)?, packet);

    server.close().await;
    assert_eq!(server.state(), DtlsState::Closed);
    assert!(server.srtp_session().is_none());
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn garbage_records_fail_the_association() -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = socket.local_addr()?;
    // nobody answers on the peer address
    let peer: SocketAddr = "127.0.0.1:9".parse()?;
    let mut config = test_config()?;
    config.receive_timeout = Duration::from_millis(200);
    config.handshake_timeout = Duration::from_secs(2);
    let association = DtlsAssociation::new(config, socket, local, peer, false);

    association.offer(Bytes::from_static(&[
        22, 0xFE, 0xFD, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xFF,
    ]));
    let mut rx = association.subscribe_state();
    let state = timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| matches!(s, DtlsState::Failed)),
    )
    .await??
    .clone();
    assert_eq!(state, DtlsState::Failed);

    // records after failure are dropped without restarting
    association.offer(Bytes::from_static(&[22, 0xFE, 0xFD]));
    assert_eq!(association.state(), DtlsState::Failed);
    Ok(())
}
