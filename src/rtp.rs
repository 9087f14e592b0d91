use crate::errors::{RtpError, RtpResult};
use bytes::Bytes;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
pub const RTCP_HEADER_LEN: usize = 4;

pub const RTCP_PT_SR: u8 = 200;
pub const RTCP_PT_RR: u8 = 201;
pub const RTCP_PT_SDES: u8 = 202;
pub const RTCP_PT_BYE: u8 = 203;
pub const RTCP_PT_PSFB: u8 = 206;

pub const SDES_END: u8 = 0;
pub const SDES_CNAME: u8 = 1;

pub const PSFB_FMT_PLI: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderExtension {
    pub profile: u16,
    /// Raw extension body, always a multiple of four bytes.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension: Option<RtpHeaderExtension>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extension: None,
        }
    }

    pub fn marshal_size(&self) -> usize {
        let ext = self
            .extension
            .as_ref()
            .map(|e| 4 + e.data.len())
            .unwrap_or(0);
        RTP_HEADER_LEN + self.csrcs.len() * 4 + ext
    }

    /// Parses the fixed header, CSRC list and extension. Returns the header and
    /// the offset of the first payload byte.
    pub fn parse(data: &[u8]) -> RtpResult<(Self, bool, usize)> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::PacketTooShort);
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }
        let padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        let csrc_end = offset + csrc_count * 4;
        if data.len() < csrc_end {
            return Err(RtpError::Length {
                declared: csrc_end,
                available: data.len(),
            });
        }
        let csrcs = data[offset..csrc_end]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset = csrc_end;

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::PacketTooShort);
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            let end = offset + words * 4;
            if data.len() < end {
                return Err(RtpError::Length {
                    declared: end,
                    available: data.len(),
                });
            }
            let ext = RtpHeaderExtension {
                profile,
                data: Bytes::copy_from_slice(&data[offset..end]),
            };
            offset = end;
            Some(ext)
        } else {
            None
        };

        Ok((
            Self {
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrcs,
                extension,
            },
            padding,
            offset,
        ))
    }

    fn marshal_to(&self, padding: bool, buf: &mut Vec<u8>) -> RtpResult<()> {
        if self.csrcs.len() > 15 {
            return Err(RtpError::InvalidHeader("more than 15 CSRCs"));
        }
        if self.payload_type > 0x7F {
            return Err(RtpError::InvalidHeader("payload type exceeds 7 bits"));
        }
        let mut b0 = RTP_VERSION << 6 | self.csrcs.len() as u8;
        if padding {
            b0 |= 0x20;
        }
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        buf.push(b0);
        buf.push(if self.marker { 0x80 } else { 0 } | self.payload_type);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrcs {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
        if let Some(ext) = &self.extension {
            if ext.data.len() % 4 != 0 {
                return Err(RtpError::InvalidHeader("extension not 32-bit aligned"));
            }
            buf.extend_from_slice(&ext.profile.to_be_bytes());
            buf.extend_from_slice(&((ext.data.len() / 4) as u16).to_be_bytes());
            buf.extend_from_slice(&ext.data);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
    /// Number of trailing padding octets, including the count octet itself.
    pub padding_len: u8,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
            padding_len: 0,
        }
    }

    pub fn parse(data: &[u8]) -> RtpResult<Self> {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Decodes a packet whose payload stays a view into `data`.
    pub fn from_bytes(data: Bytes) -> RtpResult<Self> {
        let (header, padding, offset) = RtpHeader::parse(&data)?;
        let mut end = data.len();
        let mut padding_len = 0;
        if padding {
            padding_len = data[end - 1];
            if padding_len == 0 || offset + padding_len as usize > end {
                return Err(RtpError::InvalidHeader("invalid padding length"));
            }
            end -= padding_len as usize;
        }
        Ok(Self {
            header,
            payload: data.slice(offset..end),
            padding_len,
        })
    }

    pub fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_len as usize
    }

    pub fn marshal(&self) -> RtpResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.marshal_size());
        self.header.marshal_to(self.padding_len > 0, &mut buf)?;
        buf.extend_from_slice(&self.payload);
        if self.padding_len > 0 {
            buf.extend(std::iter::repeat_n(0, self.padding_len as usize - 1));
            buf.push(self.padding_len);
        }
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative number of packets lost.
    pub cumulative_lost: u32,
    pub extended_highest_sequence: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay_since_last_sender_report: u32,
}

impl ReportBlock {
    const LEN: usize = 24;

    pub fn cycles(&self) -> u16 {
        (self.extended_highest_sequence >> 16) as u16
    }

    pub fn highest_sequence(&self) -> u16 {
        self.extended_highest_sequence as u16
    }

    pub fn dlsr_seconds(&self) -> f64 {
        self.delay_since_last_sender_report as f64 / 65536.0
    }

    fn parse(data: &[u8]) -> Self {
        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Self {
            ssrc: word(0),
            fraction_lost: data[4],
            cumulative_lost: word(4) & 0x00FF_FFFF,
            extended_highest_sequence: word(8),
            jitter: word(12),
            last_sender_report: word(16),
            delay_since_last_sender_report: word(20),
        }
    }

    fn marshal_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.push(self.fraction_lost);
        buf.extend_from_slice(&(self.cumulative_lost & 0x00FF_FFFF).to_be_bytes()[1..]);
        buf.extend_from_slice(&self.extended_highest_sequence.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&self.last_sender_report.to_be_bytes());
        buf.extend_from_slice(&self.delay_since_last_sender_report.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    /// Middle 32 bits of the NTP timestamp, as echoed in a report block's LSR.
    pub fn compact_ntp(&self) -> u32 {
        (self.ntp_sec << 16) | (self.ntp_frac >> 16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: String,
}

impl SdesItem {
    pub fn cname(text: impl Into<String>) -> Self {
        Self {
            item_type: SDES_CNAME,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub source: u32,
    pub items: Vec<SdesItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    pub fn cname(source: u32, cname: impl Into<String>) -> Self {
        Self {
            chunks: vec![SdesChunk {
                source,
                items: vec![SdesItem::cname(cname)],
            }],
        }
    }
}

/// Payload-specific feedback (RFC 4585). FMT 1 is a Picture Loss Indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFeedback {
    pub fmt: u8,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fci: Bytes,
}

impl PayloadFeedback {
    pub fn pli(sender_ssrc: u32, media_ssrc: u32) -> Self {
        Self {
            fmt: PSFB_FMT_PLI,
            sender_ssrc,
            media_ssrc,
            fci: Bytes::new(),
        }
    }

    pub fn is_pli(&self) -> bool {
        self.fmt == PSFB_FMT_PLI
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRtcp {
    pub packet_type: u8,
    pub count: u8,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    PayloadFeedback(PayloadFeedback),
    Goodbye(Goodbye),
    Unknown(UnknownRtcp),
}

impl RtcpPacket {
    /// SSRC of the packet sender; the first source for SDES and BYE.
    pub fn sender_ssrc(&self) -> Option<u32> {
        match self {
            RtcpPacket::SenderReport(sr) => Some(sr.ssrc),
            RtcpPacket::ReceiverReport(rr) => Some(rr.ssrc),
            RtcpPacket::SourceDescription(sdes) => sdes.chunks.first().map(|c| c.source),
            RtcpPacket::PayloadFeedback(fb) => Some(fb.sender_ssrc),
            RtcpPacket::Goodbye(bye) => bye.sources.first().copied(),
            RtcpPacket::Unknown(_) => None,
        }
    }

    pub fn parse_compound(data: &[u8]) -> RtpResult<Vec<RtcpPacket>> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset + RTCP_HEADER_LEN <= data.len() {
            let b0 = data[offset];
            let version = b0 >> 6;
            if version != RTP_VERSION {
                return Err(RtpError::UnsupportedVersion(version));
            }
            let padding = b0 & 0x20 != 0;
            let count = b0 & 0x1F;
            let packet_type = data[offset + 1];
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let end = offset + (words + 1) * 4;
            if end > data.len() {
                return Err(RtpError::Length {
                    declared: end - offset,
                    available: data.len() - offset,
                });
            }
            let mut body = &data[offset + RTCP_HEADER_LEN..end];
            if padding {
                let pad = *body.last().ok_or(RtpError::PacketTooShort)? as usize;
                if pad == 0 || pad > body.len() {
                    return Err(RtpError::InvalidHeader("invalid RTCP padding"));
                }
                body = &body[..body.len() - pad];
            }
            packets.push(Self::parse_body(packet_type, count, body)?);
            offset = end;
        }
        Ok(packets)
    }

    fn parse_body(packet_type: u8, count: u8, body: &[u8]) -> RtpResult<RtcpPacket> {
        let word = |i: usize| u32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        let packet = match packet_type {
            RTCP_PT_SR => {
                let needed = 24 + count as usize * ReportBlock::LEN;
                if body.len() < needed {
                    return Err(RtpError::PacketTooShort);
                }
                RtcpPacket::SenderReport(SenderReport {
                    ssrc: word(0),
                    ntp_sec: word(4),
                    ntp_frac: word(8),
                    rtp_timestamp: word(12),
                    packet_count: word(16),
                    octet_count: word(20),
                    reports: parse_report_blocks(&body[24..], count),
                })
            }
            RTCP_PT_RR => {
                let needed = 4 + count as usize * ReportBlock::LEN;
                if body.len() < needed {
                    return Err(RtpError::PacketTooShort);
                }
                RtcpPacket::ReceiverReport(ReceiverReport {
                    ssrc: word(0),
                    reports: parse_report_blocks(&body[4..], count),
                })
            }
            RTCP_PT_SDES => RtcpPacket::SourceDescription(parse_sdes(body, count)?),
            RTCP_PT_BYE => {
                let needed = count as usize * 4;
                if body.len() < needed {
                    return Err(RtpError::PacketTooShort);
                }
                let sources = (0..count as usize).map(|i| word(i * 4)).collect();
                let reason = body.get(needed).and_then(|&len| {
                    body.get(needed + 1..needed + 1 + len as usize)
                        .map(|text| String::from_utf8_lossy(text).into_owned())
                });
                RtcpPacket::Goodbye(Goodbye { sources, reason })
            }
            RTCP_PT_PSFB => {
                if body.len() < 8 {
                    return Err(RtpError::PacketTooShort);
                }
                RtcpPacket::PayloadFeedback(PayloadFeedback {
                    fmt: count,
                    sender_ssrc: word(0),
                    media_ssrc: word(4),
                    fci: Bytes::copy_from_slice(&body[8..]),
                })
            }
            _ => RtcpPacket::Unknown(UnknownRtcp {
                packet_type,
                count,
                body: Bytes::copy_from_slice(body),
            }),
        };
        Ok(packet)
    }

    pub fn marshal(&self) -> RtpResult<Vec<u8>> {
        let mut body = Vec::new();
        let (count, packet_type) = match self {
            RtcpPacket::SenderReport(sr) => {
                check_count(sr.reports.len())?;
                for v in [
                    sr.ssrc,
                    sr.ntp_sec,
                    sr.ntp_frac,
                    sr.rtp_timestamp,
                    sr.packet_count,
                    sr.octet_count,
                ] {
                    body.extend_from_slice(&v.to_be_bytes());
                }
                for block in &sr.reports {
                    block.marshal_to(&mut body);
                }
                (sr.reports.len() as u8, RTCP_PT_SR)
            }
            RtcpPacket::ReceiverReport(rr) => {
                check_count(rr.reports.len())?;
                body.extend_from_slice(&rr.ssrc.to_be_bytes());
                for block in &rr.reports {
                    block.marshal_to(&mut body);
                }
                (rr.reports.len() as u8, RTCP_PT_RR)
            }
            RtcpPacket::SourceDescription(sdes) => {
                check_count(sdes.chunks.len())?;
                for chunk in &sdes.chunks {
                    let start = body.len();
                    body.extend_from_slice(&chunk.source.to_be_bytes());
                    for item in &chunk.items {
                        let text = item.text.as_bytes();
                        if text.len() > 255 {
                            return Err(RtpError::InvalidHeader("SDES item longer than 255"));
                        }
                        body.push(item.item_type);
                        body.push(text.len() as u8);
                        body.extend_from_slice(text);
                    }
                    body.push(SDES_END);
                    let pad = (4 - (body.len() - start) % 4) % 4;
                    body.extend(std::iter::repeat_n(0, pad));
                }
                (sdes.chunks.len() as u8, RTCP_PT_SDES)
            }
            RtcpPacket::PayloadFeedback(fb) => {
                if fb.fci.len() % 4 != 0 {
                    return Err(RtpError::InvalidHeader("FCI not 32-bit aligned"));
                }
                body.extend_from_slice(&fb.sender_ssrc.to_be_bytes());
                body.extend_from_slice(&fb.media_ssrc.to_be_bytes());
                body.extend_from_slice(&fb.fci);
                (fb.fmt & 0x1F, RTCP_PT_PSFB)
            }
            RtcpPacket::Goodbye(bye) => {
                check_count(bye.sources.len())?;
                for source in &bye.sources {
                    body.extend_from_slice(&source.to_be_bytes());
                }
                if let Some(reason) = &bye.reason {
                    let text = reason.as_bytes();
                    if text.len() > 255 {
                        return Err(RtpError::InvalidHeader("BYE reason longer than 255"));
                    }
                    body.push(text.len() as u8);
                    body.extend_from_slice(text);
                    let pad = (4 - body.len() % 4) % 4;
                    body.extend(std::iter::repeat_n(0, pad));
                }
                (bye.sources.len() as u8, RTCP_PT_BYE)
            }
            RtcpPacket::Unknown(unknown) => {
                if unknown.body.len() % 4 != 0 {
                    return Err(RtpError::InvalidHeader("RTCP body not 32-bit aligned"));
                }
                body.extend_from_slice(&unknown.body);
                (unknown.count & 0x1F, unknown.packet_type)
            }
        };

        let mut buf = Vec::with_capacity(RTCP_HEADER_LEN + body.len());
        buf.push(RTP_VERSION << 6 | count);
        buf.push(packet_type);
        buf.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

pub fn marshal_compound(packets: &[RtcpPacket]) -> RtpResult<Vec<u8>> {
    let mut buf = Vec::new();
    for packet in packets {
        buf.extend_from_slice(&packet.marshal()?);
    }
    Ok(buf)
}

fn check_count(n: usize) -> RtpResult<()> {
    if n > 31 {
        return Err(RtpError::InvalidHeader("more than 31 items in RTCP packet"));
    }
    Ok(())
}

fn parse_report_blocks(data: &[u8], count: u8) -> Vec<ReportBlock> {
    data.chunks_exact(ReportBlock::LEN)
        .take(count as usize)
        .map(ReportBlock::parse)
        .collect()
}

fn parse_sdes(body: &[u8], count: u8) -> RtpResult<SourceDescription> {
    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for _ in 0..count {
        if offset + 4 > body.len() {
            return Err(RtpError::PacketTooShort);
        }
        let start = offset;
        let source = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
        offset += 4;
        let mut items = Vec::new();
        loop {
            let Some(&item_type) = body.get(offset) else {
                return Err(RtpError::PacketTooShort);
            };
            if item_type == SDES_END {
                offset += 1;
                break;
            }
            let len = *body.get(offset + 1).ok_or(RtpError::PacketTooShort)? as usize;
            let text = body
                .get(offset + 2..offset + 2 + len)
                .ok_or(RtpError::PacketTooShort)?;
            items.push(SdesItem {
                item_type,
                text: String::from_utf8_lossy(text).into_owned(),
            });
            offset += 2 + len;
        }
        offset += (4 - (offset - start) % 4) % 4;
        chunks.push(SdesChunk { source, items });
    }
    Ok(SourceDescription { chunks })
}

/// Returns true for an RTP payload type, false for the RTCP range 200..=207
/// that the demultiplexer treats as SRTCP.
pub fn is_rtp_payload_type(byte1: u8) -> bool {
    !(200..=207).contains(&byte1)
}
