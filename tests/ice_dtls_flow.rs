use anyhow::{Result, bail};
use dtls::config::Config;
use dtls::conn::DTLSConn;
use dtls::crypto::Certificate;
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use rustsfu::rtp::{RtpHeader, SenderReport, marshal_compound};
use rustsfu::time::unix_ns_to_ntp;
use rustsfu::transports::ice::connectivity_check;
use rustsfu::transports::ice::stun::{StunClass, StunMessage};
use rustsfu::{
    IceCredentialPair, MediaKind, MediaLineInfo, RtcpPacket, RtpPacket, SfuConfigBuilder,
    SfuEvent, SfuServer, SrtpProfile, SrtpSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use webrtc_util::KeyingMaterialExporter;

const MEDIA_SSRC: u32 = 0x0BAD_CAFE;

#[tokio::test]
async fn stun_then_dtls_then_srtp_reaches_the_producer() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let config = SfuConfigBuilder::new()
        .bind_addr("127.0.0.1:0".parse()?)
        .dtls_handshake_timeout(Duration::from_secs(10))
        .build();
    let (server, mut events) = SfuServer::bind(config).await?;
    assert_eq!(server.fingerprint().split(':').count(), 32);

    let credentials = IceCredentialPair::generate();
    let peer = server.sfu().add_peer(credentials.clone())?;
    let producer = server.sfu().add_producer(
        peer.id(),
        MediaLineInfo::new(MediaKind::Video, MEDIA_SSRC, "browser"),
    )?;

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    socket.connect(server.local_addr()).await?;

    // ICE: one authenticated check promotes the endpoint
    let request = connectivity_check(&credentials, "brws", [0x42; 12], true)?;
    socket.send(&request).await?;
    let mut buf = vec![0u8; 1500];
    let n = timeout(Duration::from_secs(2), socket.recv(&mut buf)).await??;
    let response = StunMessage::decode(&buf[..n])?;
    assert_eq!(response.message.class, StunClass::SuccessResponse);
    assert_eq!(response.message.xor_mapped_address(), Some(socket.local_addr()?));
    assert!(response.verify_message_integrity(&buf[..n], credentials.password.as_bytes()));
    assert!(response.verify_fingerprint(&buf[..n]));

    // DTLS: the browser side is the client
    let client_config = Config {
        certificates: vec![Certificate::generate_self_signed(vec!["browser".to_string()])?],
        srtp_protection_profiles: vec![SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80],
        insecure_skip_verify: true,
        ..Default::default()
    };
    let conn = timeout(
        Duration::from_secs(10),
        DTLSConn::new(socket.clone(), client_config, true, None),
    )
    .await??;
    let material = conn
        .connection_state()
        .await
        .export_keying_material("EXTRACTOR-dtls_srtp", &[], 60)
        .await?;
    let srtp = SrtpSession::from_exported(SrtpProfile::Aes128CmHmacSha1_80, &material, true)?;

    // SRTP/SRTCP: retry until the server side has finished its half
    let (ntp_sec, ntp_frac) = unix_ns_to_ntp(1_700_000_000_000_000_000);
    let sr = RtcpPacket::SenderReport(SenderReport {
        ssrc: MEDIA_SSRC,
        ntp_sec,
        ntp_frac,
        rtp_timestamp: 3_000,
        ..Default::default()
    });
    let mut seq = 1u16;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !producer.has_source_clock() {
        if tokio::time::Instant::now() > deadline {
            bail!("SRTCP sender report never reached the producer");
        }
        let header = RtpHeader::new(96, seq, seq as u32 * 3_000, MEDIA_SSRC);
        let mut rtp = RtpPacket::new(header, vec![7u8; 200]).marshal()?;
        srtp.protect_rtp(&mut rtp)?;
        socket.send(&rtp).await?;
        let mut rtcp = marshal_compound(std::slice::from_ref(&sr))?;
        srtp.protect_rtcp(&mut rtcp)?;
        socket.send(&rtcp).await?;
        seq += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // the transport is attached right after the SRTP session is stored
    timeout(Duration::from_secs(1), async {
        while !peer.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let block = producer.report_block(0).expect("RTP was accounted");
    assert_eq!(block.ssrc, MEDIA_SSRC);
    assert!(block.highest_sequence() >= 1);

    let session = server
        .dispatcher()
        .session(socket.local_addr()?)
        .expect("endpoint session exists");
    assert_eq!(session.peer(), Some(peer.id()));
    assert!(session.srtp_session().is_some());

    let mut connected = false;
    while let Ok(event) = events.try_recv() {
        if event == (SfuEvent::PeerConnected { peer: peer.id() }) {
            connected = true;
        }
    }
    assert!(connected);

    // explicit teardown detaches the peer
    assert!(server.dispatcher().close(socket.local_addr()?).await);
    assert!(!peer.is_connected());
    let _ = conn.close().await;
    Ok(())
}

#[tokio::test]
async fn checks_with_wrong_password_get_no_answer() -> Result<()> {
    let config = SfuConfigBuilder::new()
        .bind_addr("127.0.0.1:0".parse()?)
        .build();
    let (server, _events) = SfuServer::bind(config).await?;
    let credentials = IceCredentialPair::generate();
    server.sfu().add_peer(credentials.clone())?;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server.local_addr()).await?;
    let forged = IceCredentialPair::new(credentials.username_fragment.clone(), "guess");
    socket
        .send(&connectivity_check(&forged, "brws", [1; 12], true)?)
        .await?;

    let mut buf = [0u8; 1500];
    assert!(
        timeout(Duration::from_millis(300), socket.recv(&mut buf))
            .await
            .is_err()
    );
    let session = server.dispatcher().session(socket.local_addr()?);
    assert!(session.is_some_and(|s| s.peer().is_none()));
    Ok(())
}
