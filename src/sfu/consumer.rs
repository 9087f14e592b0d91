use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tracing::{debug, trace};

use crate::config::ConsumerTiming;
use crate::rtp::{Goodbye, RtpPacket, SenderReport, SourceDescription};
use crate::sfu::PeerId;
use crate::sfu::producer::{ProducerId, SourceClock, source_time_ns};
use crate::time::unix_ns_to_ntp;

pub type ConsumerId = u64;

/// Fixes a consumer's send clock to its producer's source clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAnchor {
    pub anchor_source_ns: u64,
    pub anchor_send_ns: u64,
    /// NTP time reported in Sender Reports for `anchor_send_ns`. Equal to the
    /// source time so the producer's lip-sync survives forwarding.
    pub anchor_ntp_ns: u64,
}

impl TimeAnchor {
    fn send_time(&self, source_ns: u64) -> u64 {
        let offset = source_ns as i128 - self.anchor_source_ns as i128;
        (self.anchor_send_ns as i128 + offset).max(0) as u64
    }

    fn source_time(&self, send_ns: u64) -> u64 {
        let offset = send_ns as i128 - self.anchor_send_ns as i128;
        (self.anchor_source_ns as i128 + offset).max(0) as u64
    }

    fn ntp_time(&self, source_ns: u64) -> u64 {
        let offset = source_ns as i128 - self.anchor_source_ns as i128;
        (self.anchor_ntp_ns as i128 + offset).max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    WaitingSourceTime,
    WaitingAnchor,
    Running(TimeAnchor),
}

#[derive(Debug)]
struct Pending {
    send_ns: u64,
    order: u64,
    /// Absent for sentinels until the anchor exists.
    source_ns: Option<u64>,
    packet: RtpPacket,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.send_ns == other.send_ns && self.order == other.order
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.send_ns, self.order).cmp(&(other.send_ns, other.order))
    }
}

#[derive(Debug)]
struct ConsumerInner {
    clock: ClockState,
    queue: BinaryHeap<Reverse<Pending>>,
    next_order: u64,
    next_sequence: u16,
    packet_count: u32,
    octet_count: u32,
    last_rtp_timestamp: u32,
    last_ntp_ns: u64,
    dropped: u64,
}

/// One forwarding target of a producer on a subscriber's transport.
///
/// Packets carry the producer's RTP timestamps but are re-stamped with the
/// consumer's own SSRC and a contiguous sequence space on the way out.
#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    producer_id: ProducerId,
    peer_id: PeerId,
    ssrc: u32,
    rtx_ssrc: Option<u32>,
    payload_type: u8,
    clock_rate: u32,
    cname: String,
    timing: ConsumerTiming,
    inner: Mutex<ConsumerInner>,
}

pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub cname: String,
    /// The producer already has a source clock.
    pub source_ready: bool,
    pub initial_sequence: u16,
}

impl Consumer {
    pub fn new(params: ConsumerParams, timing: ConsumerTiming) -> Self {
        let clock = if params.source_ready {
            ClockState::WaitingAnchor
        } else {
            ClockState::WaitingSourceTime
        };
        Self {
            id: params.id,
            producer_id: params.producer_id,
            peer_id: params.peer_id,
            ssrc: params.ssrc,
            rtx_ssrc: params.rtx_ssrc,
            payload_type: params.payload_type,
            clock_rate: params.clock_rate,
            cname: params.cname,
            timing,
            inner: Mutex::new(ConsumerInner {
                clock,
                queue: BinaryHeap::new(),
                next_order: 0,
                next_sequence: params.initial_sequence,
                packet_count: 0,
                octet_count: 0,
                last_rtp_timestamp: 0,
                last_ntp_ns: 0,
                dropped: 0,
            }),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.rtx_ssrc
    }

    pub fn clock_state(&self) -> ClockState {
        self.inner.lock().unwrap().clock
    }

    pub fn time_anchor(&self) -> Option<TimeAnchor> {
        match self.clock_state() {
            ClockState::Running(anchor) => Some(anchor),
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Packets dropped for a full queue or a stale send time.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// The producer received its first Sender Report.
    pub fn source_clock_ready(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.clock == ClockState::WaitingSourceTime {
            trace!("consumer {} waiting for anchor", self.id);
            inner.clock = ClockState::WaitingAnchor;
        }
    }

    /// Queues a forwarded packet. `source_ns` is the producer's source time
    /// for it, absent until the producer has a Sender Report.
    pub fn enqueue(&self, packet: RtpPacket, source_ns: Option<u64>, now_ns: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= self.timing.capacity {
            inner.dropped += 1;
            trace!(
                "consumer {} queue full, dropping seq {}",
                self.id, packet.header.sequence_number
            );
            return false;
        }

        if source_ns.is_some() && inner.clock == ClockState::WaitingSourceTime {
            inner.clock = ClockState::WaitingAnchor;
        }

        let send_ns = match (inner.clock, source_ns) {
            (ClockState::WaitingAnchor, Some(source_ns)) => {
                let anchor = TimeAnchor {
                    anchor_source_ns: source_ns,
                    anchor_send_ns: now_ns + self.timing.initial_delay_ns,
                    anchor_ntp_ns: source_ns,
                };
                inner.clock = ClockState::Running(anchor);
                let clock = SourceClock {
                    base_rtp_ts: packet.header.timestamp,
                    base_ntp_ns: source_ns,
                };
                reanchor_sentinels(
                    &mut inner.queue,
                    anchor.anchor_send_ns,
                    clock,
                    self.clock_rate,
                );
                debug!(
                    "consumer {} anchored: source {}ns -> send {}ns",
                    self.id, anchor.anchor_source_ns, anchor.anchor_send_ns
                );
                anchor.anchor_send_ns
            }
            (ClockState::Running(anchor), Some(source_ns)) => anchor.send_time(source_ns),
            (ClockState::Running(_), None) => now_ns,
            // sentinel until the anchor exists
            _ => 0,
        };

        let order = inner.next_order;
        inner.next_order += 1;
        inner.queue.push(Reverse(Pending {
            send_ns,
            order,
            source_ns,
            packet,
        }));
        true
    }

    /// Pops up to `max` packets due at `now_ns`, rewritten for this
    /// consumer. Nothing is released before the anchor exists.
    pub fn poll_ready(&self, now_ns: u64, max: usize) -> Vec<RtpPacket> {
        let mut inner = self.inner.lock().unwrap();
        let ClockState::Running(anchor) = inner.clock else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        while ready.len() < max {
            let due = match inner.queue.peek() {
                Some(Reverse(top)) => top.send_ns <= now_ns,
                None => false,
            };
            if !due {
                break;
            }
            let Some(Reverse(pending)) = inner.queue.pop() else {
                break;
            };
            if pending.send_ns.saturating_add(self.timing.window_ns) < now_ns {
                inner.dropped += 1;
                trace!(
                    "consumer {} dropping stale seq {}",
                    self.id, pending.packet.header.sequence_number
                );
                continue;
            }

            let mut packet = pending.packet;
            packet.header.ssrc = self.ssrc;
            packet.header.payload_type = self.payload_type;
            packet.header.sequence_number = inner.next_sequence;
            inner.next_sequence = inner.next_sequence.wrapping_add(1);
            inner.packet_count = inner.packet_count.wrapping_add(1);
            inner.octet_count = inner.octet_count.wrapping_add(packet.payload.len() as u32);
            inner.last_rtp_timestamp = packet.header.timestamp;
            inner.last_ntp_ns = match pending.source_ns {
                Some(source_ns) => anchor.ntp_time(source_ns),
                None => anchor.ntp_time(anchor.source_time(pending.send_ns)),
            };
            ready.push(packet);
        }
        ready
    }

    /// Sender Report for what has been sent so far. The NTP/RTP pair is
    /// that of the last packet sent.
    pub fn sender_report(&self) -> Option<SenderReport> {
        let inner = self.inner.lock().unwrap();
        if !matches!(inner.clock, ClockState::Running(_)) || inner.packet_count == 0 {
            return None;
        }
        let (ntp_sec, ntp_frac) = unix_ns_to_ntp(inner.last_ntp_ns);
        Some(SenderReport {
            ssrc: self.ssrc,
            ntp_sec,
            ntp_frac,
            rtp_timestamp: inner.last_rtp_timestamp,
            packet_count: inner.packet_count,
            octet_count: inner.octet_count,
            reports: Vec::new(),
        })
    }

    pub fn source_description(&self) -> SourceDescription {
        SourceDescription::cname(self.ssrc, self.cname.clone())
    }

    pub fn goodbye(&self) -> Goodbye {
        Goodbye {
            sources: vec![self.ssrc],
            reason: None,
        }
    }

    /// Discards everything queued, returning how many packets were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.queue.len();
        inner.queue.clear();
        n
    }
}

/// Sentinels leave with the anchoring packet but keep source times of their
/// own, derived from their RTP timestamps.
fn reanchor_sentinels(
    queue: &mut BinaryHeap<Reverse<Pending>>,
    send_ns: u64,
    clock: SourceClock,
    clock_rate: u32,
) {
    let mut pending = std::mem::take(queue).into_vec();
    for Reverse(p) in pending.iter_mut() {
        if p.send_ns == 0 {
            p.send_ns = send_ns;
            p.source_ns = Some(source_time_ns(clock, p.packet.header.timestamp, clock_rate));
        }
    }
    *queue = BinaryHeap::from(pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeader;

    const MS: u64 = 1_000_000;

    fn consumer(source_ready: bool, timing: ConsumerTiming) -> Consumer {
        Consumer::new(
            ConsumerParams {
                id: 1,
                producer_id: 2,
                peer_id: 3,
                ssrc: 0xC0C0_0001,
                rtx_ssrc: None,
                payload_type: 100,
                clock_rate: 90_000,
                cname: "sfu".into(),
                source_ready,
                initial_sequence: 500,
            },
            timing,
        )
    }

    fn rtp(seq: u16, ts: u32) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(96, seq, ts, 0x1111), vec![1u8; 100])
    }

    #[test]
    fn sentinels_wait_for_the_anchor() {
        let c = consumer(false, ConsumerTiming::default());
        assert!(c.enqueue(rtp(100, 90_000), None, 1_000 * MS));
        assert!(c.poll_ready(u64::MAX, 10).is_empty());
        assert_eq!(c.clock_state(), ClockState::WaitingSourceTime);

        c.source_clock_ready();
        assert_eq!(c.clock_state(), ClockState::WaitingAnchor);
        assert!(c.poll_ready(u64::MAX, 10).is_empty());

        let now = 2_000 * MS;
        let source = 7_000 * MS;
        assert!(c.enqueue(rtp(101, 93_000), Some(source), now));
        let anchor = c.time_anchor().unwrap();
        assert_eq!(anchor.anchor_send_ns, now + 50 * MS);
        assert_eq!(anchor.anchor_source_ns, source);
        assert_eq!(anchor.anchor_ntp_ns, source);

        assert!(c.poll_ready(now + 49 * MS, 10).is_empty());
        let out = c.poll_ready(now + 50 * MS, 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].header.timestamp, 90_000);
        assert_eq!(out[1].header.timestamp, 93_000);
        assert_eq!(out[0].header.sequence_number, 500);
        assert_eq!(out[1].header.sequence_number, 501);
        assert!(out.iter().all(|p| p.header.ssrc == 0xC0C0_0001));
        assert!(out.iter().all(|p| p.header.payload_type == 100));
    }

    #[test]
    fn send_times_follow_source_times() {
        let c = consumer(true, ConsumerTiming::default());
        let now = 10_000 * MS;
        c.enqueue(rtp(1, 0), Some(500 * MS), now);
        // arrives early, sent relative to its source time
        c.enqueue(rtp(3, 6_000), Some(566 * MS), now + MS);
        c.enqueue(rtp(2, 3_000), Some(533 * MS), now + 2 * MS);

        let first = c.poll_ready(now + 50 * MS, 10);
        assert_eq!(first.len(), 1);
        let second = c.poll_ready(now + 83 * MS, 10);
        assert_eq!(second[0].header.timestamp, 3_000);
        let third = c.poll_ready(now + 116 * MS, 10);
        assert_eq!(third[0].header.timestamp, 6_000);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn batch_limit_is_respected() {
        let c = consumer(true, ConsumerTiming::default());
        for i in 0..5u16 {
            c.enqueue(rtp(i, i as u32), Some(MS), 0);
        }
        assert_eq!(c.poll_ready(50 * MS, 2).len(), 2);
        assert_eq!(c.poll_ready(50 * MS, 2).len(), 2);
        assert_eq!(c.poll_ready(50 * MS, 2).len(), 1);
    }

    #[test]
    fn stale_packets_and_overflow_are_dropped() {
        let timing = ConsumerTiming {
            initial_delay_ns: 50 * MS,
            window_ns: 500 * MS,
            capacity: 3,
        };
        let c = consumer(true, timing);
        assert!(c.enqueue(rtp(1, 0), Some(0), 0));
        assert!(c.enqueue(rtp(2, 90), Some(MS), 0));
        assert!(c.enqueue(rtp(3, 180), Some(2 * MS), 0));
        assert!(!c.enqueue(rtp(4, 270), Some(3 * MS), 0));
        assert_eq!(c.dropped(), 1);

        // everything is older than the window by now
        assert!(c.poll_ready(600 * MS, 10).is_empty());
        assert_eq!(c.dropped(), 4);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn sender_report_matches_last_sent_packet() {
        let c = consumer(true, ConsumerTiming::default());
        assert!(c.sender_report().is_none());
        let source = 1_700_000_000_000_000_000;
        c.enqueue(rtp(1, 90_000), Some(source), 5 * MS);
        c.enqueue(rtp(2, 93_000), Some(source + 33 * MS), 5 * MS);
        assert!(c.sender_report().is_none());

        c.poll_ready(55 * MS + 33 * MS, 10);
        let sr = c.sender_report().unwrap();
        assert_eq!(sr.ssrc, 0xC0C0_0001);
        assert_eq!(sr.rtp_timestamp, 93_000);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 200);
        assert_eq!((sr.ntp_sec, sr.ntp_frac), unix_ns_to_ntp(source + 33 * MS));

        assert_eq!(c.goodbye().sources, vec![0xC0C0_0001]);
        assert_eq!(c.source_description().chunks[0].source, 0xC0C0_0001);
    }

    #[test]
    fn sender_report_after_partial_sentinel_flush_keeps_ntp_rtp_pairing() {
        let c = consumer(false, ConsumerTiming::default());
        for (seq, ts) in [(1u16, 90_000u32), (2, 93_000), (3, 96_000)] {
            assert!(c.enqueue(rtp(seq, ts), None, seq as u64 * 33 * MS));
        }
        c.source_clock_ready();
        let source = 1_700_000_000_000_000_000u64;
        let now = 200 * MS;
        c.enqueue(rtp(4, 99_000), Some(source), now);

        // only the two oldest sentinels leave on this tick
        let out = c.poll_ready(now + 50 * MS, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].header.timestamp, 93_000);
        let sr = c.sender_report().unwrap();
        assert_eq!(sr.rtp_timestamp, 93_000);
        // 6000 ticks at 90kHz before the anchoring packet
        assert_eq!(
            (sr.ntp_sec, sr.ntp_frac),
            unix_ns_to_ntp(source - 66_666_666)
        );

        c.poll_ready(now + 50 * MS, 2);
        let sr = c.sender_report().unwrap();
        assert_eq!(sr.rtp_timestamp, 99_000);
        assert_eq!((sr.ntp_sec, sr.ntp_frac), unix_ns_to_ntp(source));
        assert_eq!(sr.packet_count, 4);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let c = Consumer::new(
            ConsumerParams {
                id: 1,
                producer_id: 2,
                peer_id: 3,
                ssrc: 9,
                rtx_ssrc: None,
                payload_type: 96,
                clock_rate: 90_000,
                cname: String::new(),
                source_ready: true,
                initial_sequence: u16::MAX,
            },
            ConsumerTiming::default(),
        );
        c.enqueue(rtp(7, 0), Some(0), 0);
        c.enqueue(rtp(8, 0), Some(0), 0);
        let out = c.poll_ready(50 * MS, 2);
        assert_eq!(out[0].header.sequence_number, u16::MAX);
        assert_eq!(out[1].header.sequence_number, 0);
        assert_eq!(c.clear(), 0);
    }
}
