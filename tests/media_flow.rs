use anyhow::Result;
use async_trait::async_trait;
use rustsfu::rtp::{RtpHeader, SenderReport};
use rustsfu::time::{ntp_compact, unix_ns_to_ntp};
use rustsfu::{
    ClockState, IceCredentialPair, MediaKind, MediaLineInfo, MediaTransport, RtcpPacket,
    RtpPacket, Sfu, SfuConfig, SfuResult,
};
use std::sync::{Arc, Mutex};

const MS: u64 = 1_000_000;

#[derive(Default)]
struct RecordingTransport {
    rtp: Mutex<Vec<RtpPacket>>,
    rtcp: Mutex<Vec<Vec<RtcpPacket>>>,
}

#[async_trait]
impl MediaTransport for RecordingTransport {
    async fn send_rtp_packet(&self, packet: &RtpPacket) -> SfuResult<()> {
        self.rtp.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn send_rtcp_packets(&self, packets: &[RtcpPacket]) -> SfuResult<()> {
        self.rtcp.lock().unwrap().push(packets.to_vec());
        Ok(())
    }

    async fn write_raw_datagram(&self, _data: &[u8]) -> SfuResult<()> {
        Ok(())
    }
}

fn video(seq: u16, ts: u32) -> RtpPacket {
    RtpPacket::new(RtpHeader::new(96, seq, ts, 0x5000), vec![0x42; 120])
}

#[tokio::test]
async fn consumer_anchors_on_first_packet_after_sender_report() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (sfu, _events) = Sfu::new(SfuConfig::default());
    let publisher = sfu.add_peer(IceCredentialPair::generate())?;
    let subscriber = sfu.add_peer(IceCredentialPair::generate())?;
    let producer = sfu.add_producer(
        publisher.id(),
        MediaLineInfo::new(MediaKind::Video, 0x5000, "publisher-cname"),
    )?;
    let consumer = sfu.create_consumer(subscriber.id(), producer.id())?;
    let to_publisher = Arc::new(RecordingTransport::default());
    let to_subscriber = Arc::new(RecordingTransport::default());
    sfu.attach_transport(publisher.id(), to_publisher.clone())?;
    sfu.attach_transport(subscriber.id(), to_subscriber.clone())?;

    let t0 = 1_000 * MS;
    sfu.on_rtp(publisher.id(), video(100, 90_000), t0);
    assert_eq!(consumer.clock_state(), ClockState::WaitingSourceTime);
    assert_eq!(consumer.pending(), 1);

    let ntp_ns = 1_700_000_000_000_000_000u64;
    let (ntp_sec, ntp_frac) = unix_ns_to_ntp(ntp_ns);
    let sr = SenderReport {
        ssrc: 0x5000,
        ntp_sec,
        ntp_frac,
        rtp_timestamp: 90_000,
        packet_count: 1,
        octet_count: 120,
        reports: Vec::new(),
    };
    sfu.on_rtcp(publisher.id(), &[RtcpPacket::SenderReport(sr.clone())], t0 + 10 * MS);
    assert_eq!(consumer.clock_state(), ClockState::WaitingAnchor);

    // nothing leaves before the anchor exists
    sfu.pace(t0 + 20 * MS).await;
    assert!(to_subscriber.rtp.lock().unwrap().is_empty());

    let t2 = t0 + 33 * MS;
    sfu.on_rtp(publisher.id(), video(101, 93_000), t2);
    let anchor = consumer.time_anchor().expect("running after the first timed packet");
    assert_eq!(anchor.anchor_send_ns, t2 + 50 * MS);

    sfu.pace(t2 + 50 * MS - 1).await;
    assert!(to_subscriber.rtp.lock().unwrap().is_empty());
    sfu.pace(t2 + 50 * MS).await;
    let sent = to_subscriber.rtp.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].header.timestamp, 90_000);
    assert_eq!(sent[1].header.timestamp, 93_000);
    assert_eq!(
        sent[1].header.sequence_number,
        sent[0].header.sequence_number.wrapping_add(1)
    );
    assert!(sent.iter().all(|p| p.header.ssrc == consumer.ssrc()));
    assert_eq!(sent[0].payload, video(100, 0).payload);

    sfu.send_reports(t2 + 60 * MS).await;

    let downstream = to_subscriber.rtcp.lock().unwrap().clone();
    assert_eq!(downstream.len(), 1);
    let RtcpPacket::SenderReport(consumer_sr) = &downstream[0][0] else {
        panic!("expected SR first, got {:?}", downstream[0][0]);
    };
    assert_eq!(consumer_sr.ssrc, consumer.ssrc());
    assert_eq!(consumer_sr.rtp_timestamp, 93_000);
    assert_eq!(consumer_sr.packet_count, 2);
    assert_eq!(consumer_sr.octet_count, 240);
    // NTP of the anchoring packet is its source time: 3000 ticks after the SR
    let expected_ntp = anchor.anchor_ntp_ns;
    let reported = rustsfu::time::ntp_to_unix_ns(consumer_sr.ntp_sec, consumer_sr.ntp_frac);
    assert!(reported.abs_diff(expected_ntp) <= 1);
    assert!(reported.abs_diff(ntp_ns + 100 * MS / 3) <= 2);
    let RtcpPacket::SourceDescription(sdes) = &downstream[0][1] else {
        panic!("expected SDES after SR");
    };
    assert_eq!(sdes.chunks[0].source, consumer.ssrc());
    assert_eq!(sdes.chunks[0].items[0].text, "publisher-cname");

    let upstream = to_publisher.rtcp.lock().unwrap().clone();
    assert_eq!(upstream.len(), 1);
    let RtcpPacket::ReceiverReport(rr) = &upstream[0][0] else {
        panic!("expected RR first");
    };
    assert_eq!(rr.ssrc, publisher.rtcp_ssrc());
    let block = rr.reports[0];
    assert_eq!(block.ssrc, 0x5000);
    assert_eq!(block.highest_sequence(), 101);
    assert_eq!(block.cumulative_lost, 0);
    assert_eq!(block.last_sender_report, ntp_compact(ntp_sec, ntp_frac));
    // consumer creation asked the publisher for a keyframe
    assert!(matches!(&upstream[0][1], RtcpPacket::PayloadFeedback(fb) if fb.is_pli()));
    Ok(())
}

#[tokio::test]
async fn sender_reports_pair_ntp_and_rtp_of_the_same_packet() -> Result<()> {
    let (sfu, _events) = Sfu::new(SfuConfig::default());
    let publisher = sfu.add_peer(IceCredentialPair::generate())?;
    let subscriber = sfu.add_peer(IceCredentialPair::generate())?;
    let producer = sfu.add_producer(
        publisher.id(),
        MediaLineInfo::new(MediaKind::Video, 0x5000, "cam"),
    )?;
    sfu.create_consumer(subscriber.id(), producer.id())?;
    let transport = Arc::new(RecordingTransport::default());
    sfu.attach_transport(subscriber.id(), transport.clone())?;

    // three frames before the publisher's first SR
    for (i, ts) in [90_000u32, 93_000, 96_000].into_iter().enumerate() {
        sfu.on_rtp(publisher.id(), video(100 + i as u16, ts), i as u64 * 33 * MS);
    }
    let ntp_ns = 1_700_000_000_000_000_000u64;
    let (ntp_sec, ntp_frac) = unix_ns_to_ntp(ntp_ns);
    let sr = SenderReport {
        ssrc: 0x5000,
        ntp_sec,
        ntp_frac,
        rtp_timestamp: 90_000,
        ..Default::default()
    };
    sfu.on_rtcp(publisher.id(), &[RtcpPacket::SenderReport(sr)], 80 * MS);
    let t = 100 * MS;
    sfu.on_rtp(publisher.id(), video(103, 99_000), t);

    // batch of two: only sentinels leave before the report tick
    sfu.pace(t + 50 * MS).await;
    assert_eq!(transport.rtp.lock().unwrap().len(), 2);
    sfu.send_reports(t + 51 * MS).await;

    let reports = transport.rtcp.lock().unwrap().clone();
    let RtcpPacket::SenderReport(forwarded) = &reports[0][0] else {
        panic!("expected SR, got {:?}", reports[0][0]);
    };
    assert_eq!(forwarded.rtp_timestamp, 93_000);
    let ntp_offset = rustsfu::time::ntp_to_unix_ns(forwarded.ntp_sec, forwarded.ntp_frac) as i128
        - ntp_ns as i128;
    let rtp_offset = (forwarded.rtp_timestamp - 90_000) as i128 * 1_000_000_000 / 90_000;
    assert!((ntp_offset - rtp_offset).abs() <= 2, "{ntp_offset} vs {rtp_offset}");
    Ok(())
}

#[tokio::test]
async fn late_consumer_starts_from_existing_source_clock() -> Result<()> {
    let (sfu, _events) = Sfu::new(SfuConfig::default());
    let publisher = sfu.add_peer(IceCredentialPair::generate())?;
    let subscriber = sfu.add_peer(IceCredentialPair::generate())?;
    let producer =
        sfu.add_producer(publisher.id(), MediaLineInfo::new(MediaKind::Audio, 0x6000, "p"))?;

    let (ntp_sec, ntp_frac) = unix_ns_to_ntp(1_700_000_000_000_000_000);
    let sr = SenderReport {
        ssrc: 0x6000,
        ntp_sec,
        ntp_frac,
        rtp_timestamp: 0,
        ..Default::default()
    };
    sfu.on_rtcp(publisher.id(), &[RtcpPacket::SenderReport(sr)], 0);

    let consumer = sfu.create_consumer(subscriber.id(), producer.id())?;
    assert_eq!(consumer.clock_state(), ClockState::WaitingAnchor);

    let transport = Arc::new(RecordingTransport::default());
    sfu.attach_transport(subscriber.id(), transport.clone())?;
    // 20ms opus frames
    for i in 0..5u32 {
        let packet = RtpPacket::new(RtpHeader::new(111, i as u16, i * 960, 0x6000), vec![1; 60]);
        sfu.on_rtp(publisher.id(), packet, 100 * MS + i as u64 * 20 * MS);
    }
    for step in 0..=4u64 {
        sfu.pace(150 * MS + step * 20 * MS).await;
        assert_eq!(transport.rtp.lock().unwrap().len(), step as usize + 1);
    }
    Ok(())
}
