use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::rtp::{ReportBlock, RtpPacket, SenderReport};
use crate::sfu::PeerId;
use crate::time::{ns_to_dlsr, ntp_to_unix_ns};

pub type ProducerId = u64;

const NANOS_PER_SEC: i128 = 1_000_000_000;
const MAX_DROPOUT: u16 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One inbound media line as learned from the remote description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLineInfo {
    pub mid: String,
    pub kind: MediaKind,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub cname: String,
    pub stream_id: String,
}

impl MediaLineInfo {
    pub fn new(kind: MediaKind, ssrc: u32, cname: impl Into<String>) -> Self {
        let (mid, payload_type, clock_rate) = match kind {
            MediaKind::Audio => ("0", 111, 48_000),
            MediaKind::Video => ("1", 96, 90_000),
        };
        Self {
            mid: mid.to_string(),
            kind,
            payload_type,
            clock_rate,
            ssrc,
            rtx_ssrc: None,
            cname: cname.into(),
            stream_id: String::new(),
        }
    }

    pub fn with_rtx(mut self, rtx_ssrc: u32) -> Self {
        self.rtx_ssrc = Some(rtx_ssrc);
        self
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }
}

/// Mapping from the producer's RTP clock to source time, fixed by the
/// first Sender Report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClock {
    pub base_rtp_ts: u32,
    pub base_ntp_ns: u64,
}

#[derive(Debug, Default)]
struct ReceptionStats {
    started: bool,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    last_transit: Option<i64>,
    jitter: f64,
    /// Compact NTP of the last SR and the time it arrived.
    last_sr: Option<(u32, u64)>,
}

impl ReceptionStats {
    fn update_sequence(&mut self, seq: u16) {
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
            self.received = 1;
            return;
        }
        let delta = seq.wrapping_sub(self.max_seq);
        if delta != 0 && delta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
            self.max_seq = seq;
        }
        self.received = self.received.wrapping_add(1);
    }

    /// RFC 3550 A.8 interarrival jitter in RTP clock units.
    fn update_jitter(&mut self, rtp_ts: u32, arrival_ns: u64, clock_rate: u32) {
        let arrival = (arrival_ns as i128 * clock_rate as i128 / NANOS_PER_SEC) as i64;
        let transit = arrival.wrapping_sub(rtp_ts as i64);
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn extended_max(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }

    fn report_block(&mut self, ssrc: u32, now_ns: u64) -> ReportBlock {
        let extended_max = self.extended_max();
        let expected = extended_max.wrapping_sub(self.base_seq as u32).wrapping_add(1);
        let lost = (expected as i64 - self.received as i64).clamp(-0x80_0000, 0x7F_FFFF);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let (last_sender_report, delay_since_last_sender_report) = match self.last_sr {
            Some((lsr, at)) => (lsr, ns_to_dlsr(now_ns.saturating_sub(at))),
            None => (0, 0),
        };

        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: (lost as i32 as u32) & 0x00FF_FFFF,
            extended_highest_sequence: extended_max,
            jitter: self.jitter as u32,
            last_sender_report,
            delay_since_last_sender_report,
        }
    }
}

#[derive(Debug, Default)]
struct ProducerState {
    clock: Option<SourceClock>,
    stats: ReceptionStats,
}

/// An inbound media source published by one peer.
#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    peer_id: PeerId,
    info: MediaLineInfo,
    state: Mutex<ProducerState>,
    keyframe_requested: AtomicBool,
    rtx_dropped: AtomicU64,
}

impl Producer {
    pub fn new(id: ProducerId, peer_id: PeerId, info: MediaLineInfo) -> Self {
        Self {
            id,
            peer_id,
            info,
            state: Mutex::new(ProducerState::default()),
            keyframe_requested: AtomicBool::new(false),
            rtx_dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn info(&self) -> &MediaLineInfo {
        &self.info
    }

    pub fn ssrc(&self) -> u32 {
        self.info.ssrc
    }

    pub fn is_rtx(&self, ssrc: u32) -> bool {
        self.info.rtx_ssrc == Some(ssrc)
    }

    pub(crate) fn note_rtx_dropped(&self) {
        let n = self.rtx_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("producer {} dropped RTX packet ({} total)", self.id, n);
    }

    pub fn rtx_dropped(&self) -> u64 {
        self.rtx_dropped.load(Ordering::Relaxed)
    }

    pub fn source_clock(&self) -> Option<SourceClock> {
        self.state.lock().unwrap().clock
    }

    pub fn has_source_clock(&self) -> bool {
        self.source_clock().is_some()
    }

    /// Accounts one RTP packet and returns its source time in UNIX
    /// nanoseconds once a Sender Report has fixed the clock mapping.
    pub fn on_rtp(&self, packet: &RtpPacket, arrival_ns: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        state.stats.update_sequence(packet.header.sequence_number);
        state
            .stats
            .update_jitter(packet.header.timestamp, arrival_ns, self.info.clock_rate);
        state
            .clock
            .map(|clock| source_time_ns(clock, packet.header.timestamp, self.info.clock_rate))
    }

    /// Records a Sender Report. Returns true when this report established
    /// the source clock.
    pub fn on_sender_report(&self, report: &SenderReport, arrival_ns: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.stats.last_sr = Some((report.compact_ntp(), arrival_ns));
        if state.clock.is_some() {
            return false;
        }
        let clock = SourceClock {
            base_rtp_ts: report.rtp_timestamp,
            base_ntp_ns: ntp_to_unix_ns(report.ntp_sec, report.ntp_frac),
        };
        debug!(
            "producer {} source clock anchored at rtp {} / ntp {}ns",
            self.id, clock.base_rtp_ts, clock.base_ntp_ns
        );
        state.clock = Some(clock);
        true
    }

    /// Report block describing reception from this producer, `None` before
    /// the first packet.
    pub fn report_block(&self, now_ns: u64) -> Option<ReportBlock> {
        let mut state = self.state.lock().unwrap();
        if !state.stats.started {
            return None;
        }
        Some(state.stats.report_block(self.info.ssrc, now_ns))
    }

    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Consumes a pending keyframe request.
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::AcqRel)
    }
}

pub(crate) fn source_time_ns(clock: SourceClock, rtp_ts: u32, clock_rate: u32) -> u64 {
    let ticks = rtp_ts.wrapping_sub(clock.base_rtp_ts) as i32 as i128;
    let offset = ticks * NANOS_PER_SEC / clock_rate.max(1) as i128;
    (clock.base_ntp_ns as i128 + offset).max(0) as u64
}
