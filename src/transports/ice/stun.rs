use anyhow::{Result, anyhow, bail};
use crc32fast::Hasher;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112A442;
const FINGERPRINT_XOR: u32 = 0x5354_554e;
const HEADER_LEN: usize = 20;
const MESSAGE_INTEGRITY_LEN: usize = 20;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;
const ATTR_GOOG_NETWORK_INFO: u16 = 0xC057;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub class: StunClass,
    pub method: StunMethod,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    pub fn binding_request(transaction_id: [u8; 12], attributes: Vec<StunAttribute>) -> Self {
        Self {
            class: StunClass::Request,
            method: StunMethod::Binding,
            transaction_id,
            attributes,
        }
    }

    pub fn binding_success_response(transaction_id: [u8; 12], xor_addr: SocketAddr) -> Self {
        Self {
            class: StunClass::SuccessResponse,
            method: StunMethod::Binding,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(xor_addr)],
        }
    }

    /// Serializes the message. MESSAGE-INTEGRITY and FINGERPRINT are appended
    /// last, in that order, when requested.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Vec<u8>> {
        encode_stun_message(self, integrity_key, fingerprint)
    }

    pub fn decode(data: &[u8]) -> Result<StunDecoded> {
        decode_stun_message(data)
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMethod {
    Binding,
    Other(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    Username(String),
    Priority(u32),
    IceControlling(u64),
    IceControlled(u64),
    UseCandidate,
    MessageIntegrity([u8; MESSAGE_INTEGRITY_LEN]),
    Fingerprint(u32),
    XorMappedAddress(SocketAddr),
    Software(String),
    GoogNetworkInfo { network_id: u16, network_cost: u16 },
    /// Attributes this engine does not interpret, kept for re-serialization.
    Unknown { typ: u16, value: Vec<u8> },
}

/// A decoded message together with the byte offsets of its integrity
/// attributes, so the received bytes can be verified as they are.
#[derive(Debug, Clone)]
pub struct StunDecoded {
    pub message: StunMessage,
    pub message_integrity_offset: Option<usize>,
    pub fingerprint_offset: Option<usize>,
}

impl StunDecoded {
    /// HMAC-SHA1 over everything before MESSAGE-INTEGRITY with the length
    /// field patched as if MESSAGE-INTEGRITY were the last attribute.
    pub fn verify_message_integrity(&self, raw: &[u8], key: &[u8]) -> bool {
        let Some(offset) = self.message_integrity_offset else {
            return false;
        };
        let value_start = offset + 4;
        let Some(received) = raw.get(value_start..value_start + MESSAGE_INTEGRITY_LEN) else {
            return false;
        };
        let mut covered = raw[..offset].to_vec();
        write_length_field(&mut covered, offset - HEADER_LEN + 4 + MESSAGE_INTEGRITY_LEN);
        let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
            return false;
        };
        mac.update(&covered);
        mac.verify_slice(received).is_ok()
    }

    /// CRC-32 of everything before FINGERPRINT, XORed with "STUN".
    pub fn verify_fingerprint(&self, raw: &[u8]) -> bool {
        let Some(offset) = self.fingerprint_offset else {
            return false;
        };
        let Some(value) = raw.get(offset + 4..offset + 8) else {
            return false;
        };
        let received = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        crc32(&raw[..offset]) ^ FINGERPRINT_XOR == received
    }
}

/// True when `data` looks like a STUN message: top two bits clear and the
/// magic cookie in place.
pub(crate) fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

fn encode_stun_message(
    msg: &StunMessage,
    integrity_key: Option<&[u8]>,
    fingerprint: bool,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; HEADER_LEN];
    let method_bits: u16 = match msg.method {
        StunMethod::Binding => 0x0001,
        StunMethod::Other(bits) => bits & 0x3EEF,
    };
    let class_bits: u16 = match msg.class {
        StunClass::Request => 0x0000,
        StunClass::Indication => 0x0010,
        StunClass::SuccessResponse => 0x0100,
        StunClass::ErrorResponse => 0x0110,
    };
    buffer[0..2].copy_from_slice(&(method_bits | class_bits).to_be_bytes());
    buffer[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buffer[8..20].copy_from_slice(&msg.transaction_id);

    for attr in &msg.attributes {
        append_attribute(&mut buffer, attr, &msg.transaction_id)?;
    }
    update_length_field(&mut buffer);

    if let Some(key) = integrity_key {
        let len_including_mi = (buffer.len() - HEADER_LEN) + 4 + MESSAGE_INTEGRITY_LEN;
        write_length_field(&mut buffer, len_including_mi);
        let hmac = hmac_sha1(key, &buffer)?;
        append_raw_attribute(&mut buffer, ATTR_MESSAGE_INTEGRITY, &hmac)?;
    }

    if fingerprint {
        let len_including_fp = (buffer.len() - HEADER_LEN) + 8;
        write_length_field(&mut buffer, len_including_fp);
        let crc = crc32(&buffer) ^ FINGERPRINT_XOR;
        append_raw_attribute(&mut buffer, ATTR_FINGERPRINT, &crc.to_be_bytes())?;
    }

    update_length_field(&mut buffer);
    Ok(buffer)
}

fn append_attribute(buffer: &mut Vec<u8>, attr: &StunAttribute, tx_id: &[u8; 12]) -> Result<()> {
    match attr {
        StunAttribute::Username(value) => {
            append_raw_attribute(buffer, ATTR_USERNAME, value.as_bytes())
        }
        StunAttribute::Software(value) => {
            append_raw_attribute(buffer, ATTR_SOFTWARE, value.as_bytes())
        }
        StunAttribute::Priority(value) => {
            append_raw_attribute(buffer, ATTR_PRIORITY, &value.to_be_bytes())
        }
        StunAttribute::IceControlling(value) => {
            append_raw_attribute(buffer, ATTR_ICE_CONTROLLING, &value.to_be_bytes())
        }
        StunAttribute::IceControlled(value) => {
            append_raw_attribute(buffer, ATTR_ICE_CONTROLLED, &value.to_be_bytes())
        }
        StunAttribute::UseCandidate => append_raw_attribute(buffer, ATTR_USE_CANDIDATE, &[]),
        StunAttribute::MessageIntegrity(value) => {
            append_raw_attribute(buffer, ATTR_MESSAGE_INTEGRITY, value)
        }
        StunAttribute::Fingerprint(value) => {
            append_raw_attribute(buffer, ATTR_FINGERPRINT, &value.to_be_bytes())
        }
        StunAttribute::GoogNetworkInfo {
            network_id,
            network_cost,
        } => {
            let mut value = [0u8; 4];
            value[..2].copy_from_slice(&network_id.to_be_bytes());
            value[2..].copy_from_slice(&network_cost.to_be_bytes());
            append_raw_attribute(buffer, ATTR_GOOG_NETWORK_INFO, &value)
        }
        StunAttribute::XorMappedAddress(addr) => {
            append_xor_address(buffer, ATTR_XOR_MAPPED_ADDRESS, addr, tx_id);
            Ok(())
        }
        StunAttribute::Unknown { typ, value } => append_raw_attribute(buffer, *typ, value),
    }
}

fn append_raw_attribute(buffer: &mut Vec<u8>, typ: u16, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        bail!("STUN attribute {typ:#06x} too long");
    }
    buffer.extend_from_slice(&typ.to_be_bytes());
    buffer.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buffer.extend_from_slice(value);
    pad_four_bytes(buffer);
    Ok(())
}

fn append_xor_address(buffer: &mut Vec<u8>, typ: u16, addr: &SocketAddr, tx_id: &[u8; 12]) {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    buffer.extend_from_slice(&typ.to_be_bytes());
    match addr {
        SocketAddr::V4(v4) => {
            buffer.extend_from_slice(&8u16.to_be_bytes());
            buffer.extend_from_slice(&[0, 0x01]);
            buffer.extend_from_slice(&port.to_be_bytes());
            for (byte, mask) in v4.ip().octets().iter().zip(cookie.iter()) {
                buffer.push(byte ^ mask);
            }
        }
        SocketAddr::V6(v6) => {
            buffer.extend_from_slice(&20u16.to_be_bytes());
            buffer.extend_from_slice(&[0, 0x02]);
            buffer.extend_from_slice(&port.to_be_bytes());
            let mask = cookie.iter().chain(tx_id.iter());
            for (byte, mask) in v6.ip().octets().iter().zip(mask) {
                buffer.push(byte ^ mask);
            }
        }
    }
}

fn pad_four_bytes(buffer: &mut Vec<u8>) {
    let pad = (4 - (buffer.len() % 4)) % 4;
    buffer.extend(std::iter::repeat_n(0, pad));
}

fn update_length_field(buffer: &mut [u8]) {
    let length = buffer.len() - HEADER_LEN;
    write_length_field(buffer, length);
}

fn write_length_field(buffer: &mut [u8], length: usize) {
    buffer[2..4].copy_from_slice(&(length as u16).to_be_bytes());
}

fn decode_stun_message(bytes: &[u8]) -> Result<StunDecoded> {
    if bytes.len() < HEADER_LEN {
        bail!("STUN message too short");
    }
    if bytes[0] & 0xC0 != 0 {
        bail!("not a STUN message");
    }
    let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if length + HEADER_LEN != bytes.len() || length % 4 != 0 {
        bail!("STUN message length mismatch");
    }
    if u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) != MAGIC_COOKIE {
        bail!("STUN magic cookie mismatch");
    }
    let method = match msg_type & 0x3EEF {
        0x0001 => StunMethod::Binding,
        other => StunMethod::Other(other),
    };
    let class = match msg_type & 0x0110 {
        0x0000 => StunClass::Request,
        0x0010 => StunClass::Indication,
        0x0100 => StunClass::SuccessResponse,
        _ => StunClass::ErrorResponse,
    };
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&bytes[8..20]);

    let mut attributes = Vec::new();
    let mut message_integrity_offset = None;
    let mut fingerprint_offset = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= bytes.len() {
        let attr_start = offset;
        let typ = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            bail!("STUN attribute {typ:#06x} overruns message");
        }
        let value = &bytes[offset..offset + len];
        let attr = match typ {
            ATTR_USERNAME => StunAttribute::Username(std::str::from_utf8(value)?.to_string()),
            ATTR_SOFTWARE => StunAttribute::Software(String::from_utf8_lossy(value).into_owned()),
            ATTR_PRIORITY => StunAttribute::Priority(u32::from_be_bytes(fixed(value)?)),
            ATTR_ICE_CONTROLLING => {
                StunAttribute::IceControlling(u64::from_be_bytes(fixed(value)?))
            }
            ATTR_ICE_CONTROLLED => StunAttribute::IceControlled(u64::from_be_bytes(fixed(value)?)),
            ATTR_USE_CANDIDATE => StunAttribute::UseCandidate,
            ATTR_MESSAGE_INTEGRITY => {
                message_integrity_offset = Some(attr_start);
                StunAttribute::MessageIntegrity(fixed(value)?)
            }
            ATTR_FINGERPRINT => {
                fingerprint_offset = Some(attr_start);
                StunAttribute::Fingerprint(u32::from_be_bytes(fixed(value)?))
            }
            ATTR_XOR_MAPPED_ADDRESS => match parse_xor_address(value, &transaction_id) {
                Some(addr) => StunAttribute::XorMappedAddress(addr),
                None => bail!("malformed XOR-MAPPED-ADDRESS"),
            },
            ATTR_GOOG_NETWORK_INFO => {
                let raw: [u8; 4] = fixed(value)?;
                StunAttribute::GoogNetworkInfo {
                    network_id: u16::from_be_bytes([raw[0], raw[1]]),
                    network_cost: u16::from_be_bytes([raw[2], raw[3]]),
                }
            }
            _ => StunAttribute::Unknown {
                typ,
                value: value.to_vec(),
            },
        };
        attributes.push(attr);
        offset += len;
        offset += (4 - (len % 4)) % 4;
    }

    Ok(StunDecoded {
        message: StunMessage {
            class,
            method,
            transaction_id,
            attributes,
        },
        message_integrity_offset,
        fingerprint_offset,
    })
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N]> {
    match value.try_into() {
        Ok(array) => Ok(array),
        Err(_) => bail!("STUN attribute has length {}, expected {N}", value.len()),
    }
}

fn parse_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    match value[1] {
        0x01 if value.len() >= 8 => {
            let mut addr = [0u8; 4];
            for (i, byte) in addr.iter_mut().enumerate() {
                *byte = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::from((Ipv4Addr::from(addr), port)))
        }
        0x02 if value.len() >= 20 => {
            let mut addr = [0u8; 16];
            let mask = cookie.iter().chain(transaction_id.iter());
            for ((byte, src), mask) in addr.iter_mut().zip(&value[4..20]).zip(mask) {
                *byte = src ^ mask;
            }
            Some(SocketAddr::from((Ipv6Addr::from(addr), port)))
        }
        _ => None,
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20]> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| anyhow!("invalid HMAC key"))?;
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 20];
    output.copy_from_slice(&result);
    Ok(output)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
