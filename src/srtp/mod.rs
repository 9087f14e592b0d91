pub mod crypto;

use crate::{
    errors::{SrtpError, SrtpResult},
    rtp::{RTCP_HEADER_LEN, RtpHeader},
};
use crypto::HmacSha1;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

const SRTCP_INDEX_LEN: usize = 4;
const SRTCP_E_FLAG: u32 = 0x8000_0000;
const RTCP_FIXED_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SrtpProfile {
    #[default]
    Aes128CmHmacSha1_80,
    Aes128CmHmacSha1_32,
}

impl SrtpProfile {
    pub fn key_len(&self) -> usize {
        16
    }

    pub fn salt_len(&self) -> usize {
        14
    }

    pub fn auth_key_len(&self) -> usize {
        20
    }

    pub fn rtp_tag_len(&self) -> usize {
        match self {
            Self::Aes128CmHmacSha1_80 => 10,
            Self::Aes128CmHmacSha1_32 => 4,
        }
    }

    /// SRTCP always carries the 80-bit tag for both profiles (RFC 5764 4.1.2).
    pub fn rtcp_tag_len(&self) -> usize {
        10
    }

    /// Bytes to request from the DTLS exporter: two keys and two salts.
    pub fn keying_material_len(&self) -> usize {
        2 * (self.key_len() + self.salt_len())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

impl fmt::Debug for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpKeyingMaterial")
            .field("master_key", &format_args!("[{} bytes]", self.master_key.len()))
            .field("master_salt", &format_args!("[{} bytes]", self.master_salt.len()))
            .finish()
    }
}

impl SrtpKeyingMaterial {
    pub fn new(master_key: Vec<u8>, master_salt: Vec<u8>) -> Self {
        Self {
            master_key,
            master_salt,
        }
    }

    /// Splits exporter output `client_key | server_key | client_salt | server_salt`
    /// into `(client, server)` halves.
    pub fn split_exported(profile: SrtpProfile, material: &[u8]) -> SrtpResult<(Self, Self)> {
        let key_len = profile.key_len();
        let salt_len = profile.salt_len();
        if material.len() < profile.keying_material_len() {
            return Err(SrtpError::PacketTooShort);
        }
        let (client_key, rest) = material.split_at(key_len);
        let (server_key, rest) = rest.split_at(key_len);
        let (client_salt, rest) = rest.split_at(salt_len);
        let server_salt = &rest[..salt_len];
        Ok((
            Self::new(client_key.to_vec(), client_salt.to_vec()),
            Self::new(server_key.to_vec(), server_salt.to_vec()),
        ))
    }

    fn validate(&self, profile: SrtpProfile) -> SrtpResult<()> {
        if self.master_key.len() != profile.key_len()
            || self.master_salt.len() != profile.salt_len()
        {
            return Err(SrtpError::UnsupportedProfile);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct SessionKeys {
    cipher_key: Vec<u8>,
    salt: Vec<u8>,
    auth: HmacSha1,
}

impl SessionKeys {
    fn derive(
        profile: SrtpProfile,
        keying: &SrtpKeyingMaterial,
        labels: [u8; 3],
    ) -> SrtpResult<Self> {
        let [enc_label, auth_label, salt_label] = labels;
        let key = &keying.master_key;
        let salt = &keying.master_salt;
        let cipher_key = crypto::derive_session_key(key, salt, enc_label, profile.key_len())?;
        let auth_key = crypto::derive_session_key(key, salt, auth_label, profile.auth_key_len())?;
        let session_salt = crypto::derive_session_key(key, salt, salt_label, profile.salt_len())?;
        Ok(Self {
            cipher_key,
            salt: session_salt,
            auth: crypto::new_hmac(&auth_key)?,
        })
    }
}

/// SRTP state for one SSRC in one direction.
///
/// Replay handling is limited to rollover-counter inference from the 16-bit
/// sequence number; there is no replay window or duplicate suppression. That
/// is enough for a forwarder that only rewrites headers, not for an endpoint
/// that has to resist replayed media.
pub struct SrtpContext {
    ssrc: u32,
    profile: SrtpProfile,
    keys: SessionKeys,
    rollover_counter: u32,
    last_sequence: Option<u16>,
}

impl fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpContext")
            .field("ssrc", &self.ssrc)
            .field("profile", &self.profile)
            .field("rollover_counter", &self.rollover_counter)
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

impl SrtpContext {
    pub fn new(ssrc: u32, profile: SrtpProfile, keying: &SrtpKeyingMaterial) -> SrtpResult<Self> {
        keying.validate(profile)?;
        let keys = SessionKeys::derive(
            profile,
            keying,
            [
                crypto::LABEL_RTP_ENCRYPTION,
                crypto::LABEL_RTP_AUTH,
                crypto::LABEL_RTP_SALT,
            ],
        )?;
        Ok(Self {
            ssrc,
            profile,
            keys,
            rollover_counter: 0,
            last_sequence: None,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn rollover_counter(&self) -> u32 {
        self.rollover_counter
    }

    /// Encrypts the payload in place and appends the auth tag.
    pub fn protect(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let (header, _, offset) = RtpHeader::parse(packet)?;
        let seq = header.sequence_number;
        let roc = self.estimate_roc(seq);

        let iv = crypto::rtp_iv(&self.keys.salt, self.ssrc, roc, seq);
        crypto::apply_keystream(&self.keys.cipher_key, &iv, &mut packet[offset..])?;

        let tag = crypto::auth_tag(
            &self.keys.auth,
            &[&packet[..], &roc.to_be_bytes()],
            self.profile.rtp_tag_len(),
        );
        packet.extend_from_slice(&tag);
        self.update(seq, roc);
        Ok(())
    }

    /// Verifies the auth tag, then decrypts the payload in place and strips the tag.
    pub fn unprotect(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let tag_len = self.profile.rtp_tag_len();
        let (header, _, offset) = RtpHeader::parse(packet)?;
        if packet.len() < offset + tag_len {
            return Err(SrtpError::PacketTooShort);
        }
        let seq = header.sequence_number;
        let roc = self.estimate_roc(seq);

        let split = packet.len() - tag_len;
        let expected = crypto::auth_tag(
            &self.keys.auth,
            &[&packet[..split], &roc.to_be_bytes()],
            tag_len,
        );
        if !crypto::verify_auth_tag(&expected, &packet[split..]) {
            return Err(SrtpError::AuthenticationFailed);
        }
        packet.truncate(split);

        let iv = crypto::rtp_iv(&self.keys.salt, self.ssrc, roc, seq);
        crypto::apply_keystream(&self.keys.cipher_key, &iv, &mut packet[offset..])?;
        self.update(seq, roc);
        Ok(())
    }

    /// ROC guess for `sequence` relative to the highest sequence seen so far.
    pub fn estimate_roc(&self, sequence: u16) -> u32 {
        let Some(last) = self.last_sequence else {
            return self.rollover_counter;
        };
        let diff = sequence as i32 - last as i32;
        if diff < -32768 {
            self.rollover_counter.wrapping_add(1)
        } else if diff > 32768 {
            self.rollover_counter.saturating_sub(1)
        } else {
            self.rollover_counter
        }
    }

    fn update(&mut self, sequence: u16, roc: u32) {
        let Some(last) = self.last_sequence else {
            self.last_sequence = Some(sequence);
            self.rollover_counter = roc;
            return;
        };
        let current = ((self.rollover_counter as u64) << 16) | last as u64;
        let incoming = ((roc as u64) << 16) | sequence as u64;
        if incoming > current {
            self.rollover_counter = roc;
            self.last_sequence = Some(sequence);
        }
    }
}

/// SRTCP state for one SSRC in one direction.
pub struct SrtcpContext {
    ssrc: u32,
    profile: SrtpProfile,
    keys: SessionKeys,
    index: u32,
}

impl fmt::Debug for SrtcpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtcpContext")
            .field("ssrc", &self.ssrc)
            .field("index", &self.index)
            .finish()
    }
}

impl SrtcpContext {
    pub fn new(ssrc: u32, profile: SrtpProfile, keying: &SrtpKeyingMaterial) -> SrtpResult<Self> {
        keying.validate(profile)?;
        let keys = SessionKeys::derive(
            profile,
            keying,
            [
                crypto::LABEL_RTCP_ENCRYPTION,
                crypto::LABEL_RTCP_AUTH,
                crypto::LABEL_RTCP_SALT,
            ],
        )?;
        Ok(Self {
            ssrc,
            profile,
            keys,
            index: 0,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Encrypts everything after the first eight octets, then appends
    /// `E || index` and the auth tag.
    pub fn protect(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        if packet.len() < RTCP_FIXED_LEN {
            return Err(SrtpError::PacketTooShort);
        }
        self.index = (self.index + 1) & 0x7FFF_FFFF;
        let index = self.index;

        let iv = crypto::rtcp_iv(&self.keys.salt, self.ssrc, index);
        crypto::apply_keystream(&self.keys.cipher_key, &iv, &mut packet[RTCP_FIXED_LEN..])?;

        packet.extend_from_slice(&(index | SRTCP_E_FLAG).to_be_bytes());
        let tag = crypto::auth_tag(&self.keys.auth, &[&packet[..]], self.profile.rtcp_tag_len());
        packet.extend_from_slice(&tag);
        Ok(())
    }

    /// Authenticates before touching the ciphertext. Packets with the E flag
    /// cleared are authenticated but left as is.
    pub fn unprotect(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let tag_len = self.profile.rtcp_tag_len();
        if packet.len() < RTCP_FIXED_LEN + SRTCP_INDEX_LEN + tag_len {
            return Err(SrtpError::PacketTooShort);
        }
        let split = packet.len() - tag_len;
        let expected = crypto::auth_tag(&self.keys.auth, &[&packet[..split]], tag_len);
        if !crypto::verify_auth_tag(&expected, &packet[split..]) {
            return Err(SrtpError::AuthenticationFailed);
        }

        let index_at = split - SRTCP_INDEX_LEN;
        let e_and_index = u32::from_be_bytes([
            packet[index_at],
            packet[index_at + 1],
            packet[index_at + 2],
            packet[index_at + 3],
        ]);
        packet.truncate(index_at);

        let index = e_and_index & 0x7FFF_FFFF;
        if e_and_index & SRTCP_E_FLAG != 0 {
            let iv = crypto::rtcp_iv(&self.keys.salt, self.ssrc, index);
            crypto::apply_keystream(&self.keys.cipher_key, &iv, &mut packet[RTCP_FIXED_LEN..])?;
        }
        if index > self.index {
            self.index = index;
        }
        Ok(())
    }
}

/// Crypto context factory for one DTLS association.
///
/// Contexts are created on first use per `(ssrc, direction)`. Each context is
/// mutated under its map entry guard, and callers keep one dispatch path per
/// direction so the ROC and index heuristics see packets in arrival order.
pub struct SrtpSession {
    profile: SrtpProfile,
    local: SrtpKeyingMaterial,
    remote: SrtpKeyingMaterial,
    rtp_out: DashMap<u32, SrtpContext>,
    rtp_in: DashMap<u32, SrtpContext>,
    rtcp_out: DashMap<u32, SrtcpContext>,
    rtcp_in: DashMap<u32, SrtcpContext>,
    closed: AtomicBool,
}

impl fmt::Debug for SrtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpSession")
            .field("profile", &self.profile)
            .field("rtp_out", &self.rtp_out.len())
            .field("rtp_in", &self.rtp_in.len())
            .field("rtcp_out", &self.rtcp_out.len())
            .field("rtcp_in", &self.rtcp_in.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SrtpSession {
    /// `local` protects outbound packets, `remote` unprotects inbound ones.
    pub fn new(
        profile: SrtpProfile,
        local: SrtpKeyingMaterial,
        remote: SrtpKeyingMaterial,
    ) -> SrtpResult<Self> {
        local.validate(profile)?;
        remote.validate(profile)?;
        Ok(Self {
            profile,
            local,
            remote,
            rtp_out: DashMap::new(),
            rtp_in: DashMap::new(),
            rtcp_out: DashMap::new(),
            rtcp_in: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Builds a session from DTLS exporter output. The server side encrypts
    /// with the server half and decrypts with the client half.
    pub fn from_exported(
        profile: SrtpProfile,
        material: &[u8],
        is_client: bool,
    ) -> SrtpResult<Self> {
        let (client, server) = SrtpKeyingMaterial::split_exported(profile, material)?;
        if is_client {
            Self::new(profile, client, server)
        } else {
            Self::new(profile, server, client)
        }
    }

    pub fn profile(&self) -> SrtpProfile {
        self.profile
    }

    pub fn protect_rtp(&self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let ssrc = rtp_ssrc(packet)?;
        self.ensure_open(ssrc)?;
        let mut ctx = self
            .rtp_out
            .entry(ssrc)
            .or_try_insert_with(|| SrtpContext::new(ssrc, self.profile, &self.local))?;
        ctx.protect(packet)
    }

    /// A context for a new inbound SSRC is kept only once a packet for it
    /// authenticates, so forged streams leave no state behind.
    pub fn unprotect_rtp(&self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let ssrc = rtp_ssrc(packet)?;
        self.ensure_open(ssrc)?;
        if let Some(mut ctx) = self.rtp_in.get_mut(&ssrc) {
            return ctx.unprotect(packet);
        }
        let mut ctx = SrtpContext::new(ssrc, self.profile, &self.remote)?;
        ctx.unprotect(packet)?;
        self.rtp_in.entry(ssrc).or_insert(ctx);
        Ok(())
    }

    pub fn protect_rtcp(&self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let ssrc = rtcp_ssrc(packet)?;
        self.ensure_open(ssrc)?;
        let mut ctx = self
            .rtcp_out
            .entry(ssrc)
            .or_try_insert_with(|| SrtcpContext::new(ssrc, self.profile, &self.local))?;
        ctx.protect(packet)
    }

    pub fn unprotect_rtcp(&self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let ssrc = rtcp_ssrc(packet)?;
        self.ensure_open(ssrc)?;
        if let Some(mut ctx) = self.rtcp_in.get_mut(&ssrc) {
            return ctx.unprotect(packet);
        }
        let mut ctx = SrtcpContext::new(ssrc, self.profile, &self.remote)?;
        ctx.unprotect(packet)?;
        self.rtcp_in.entry(ssrc).or_insert(ctx);
        Ok(())
    }

    /// Drops the contexts of a stream that is no longer sent or received.
    pub fn remove_ssrc(&self, ssrc: u32) {
        self.rtp_out.remove(&ssrc);
        self.rtp_in.remove(&ssrc);
        self.rtcp_out.remove(&ssrc);
        self.rtcp_in.remove(&ssrc);
    }

    /// Clears every context; later calls fail with `MissingContext`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.rtp_out.clear();
        self.rtp_in.clear();
        self.rtcp_out.clear();
        self.rtcp_in.clear();
    }

    fn ensure_open(&self, ssrc: u32) -> SrtpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SrtpError::MissingContext(ssrc));
        }
        Ok(())
    }
}

fn rtp_ssrc(packet: &[u8]) -> SrtpResult<u32> {
    if packet.len() < 12 {
        return Err(SrtpError::PacketTooShort);
    }
    Ok(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
}

fn rtcp_ssrc(packet: &[u8]) -> SrtpResult<u32> {
    if packet.len() < RTCP_HEADER_LEN + 4 {
        return Err(SrtpError::PacketTooShort);
    }
    Ok(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
}
