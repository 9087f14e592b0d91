use crate::errors::{SrtpError, SrtpResult};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
pub(crate) type HmacSha1 = Hmac<Sha1>;

pub const LABEL_RTP_ENCRYPTION: u8 = 0x00;
pub const LABEL_RTP_AUTH: u8 = 0x01;
pub const LABEL_RTP_SALT: u8 = 0x02;
pub const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
pub const LABEL_RTCP_AUTH: u8 = 0x04;
pub const LABEL_RTCP_SALT: u8 = 0x05;

/// AES-CM PRF from RFC 3711 section 4.3 with a key derivation rate of zero.
pub fn derive_session_key(
    master_key: &[u8],
    master_salt: &[u8],
    label: u8,
    len: usize,
) -> SrtpResult<Vec<u8>> {
    if master_salt.len() > 14 {
        return Err(SrtpError::UnsupportedProfile);
    }
    let mut iv = [0u8; 16];
    iv[..master_salt.len()].copy_from_slice(master_salt);
    iv[7] ^= label;

    let mut out = vec![0u8; len];
    apply_keystream(master_key, &iv, &mut out)?;
    Ok(out)
}

/// XORs the AES counter-mode keystream starting at `iv` into `data`.
pub fn apply_keystream(key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> SrtpResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut cipher =
        Aes128Ctr::new_from_slices(key, iv).map_err(|_| SrtpError::UnsupportedProfile)?;
    cipher.apply_keystream(data);
    Ok(())
}

/// IV = (salt * 2^16) XOR (SSRC * 2^64) XOR (index * 2^16), index = ROC || SEQ.
pub fn rtp_iv(session_salt: &[u8], ssrc: u32, roc: u32, sequence: u16) -> [u8; 16] {
    let index = ((roc as u64) << 16) | sequence as u64;
    let mut block = [0u8; 16];
    block[4..8].copy_from_slice(&ssrc.to_be_bytes());
    block[8..16].copy_from_slice(&(index << 16).to_be_bytes());
    xor_salt(session_salt, block)
}

/// Same layout as the RTP IV with the 31-bit SRTCP index in place of ROC || SEQ.
pub fn rtcp_iv(session_salt: &[u8], ssrc: u32, index: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[4..8].copy_from_slice(&ssrc.to_be_bytes());
    block[10..14].copy_from_slice(&(index & 0x7FFF_FFFF).to_be_bytes());
    xor_salt(session_salt, block)
}

fn xor_salt(session_salt: &[u8], mut block: [u8; 16]) -> [u8; 16] {
    for (b, s) in block.iter_mut().zip(session_salt.iter().take(14)) {
        *b ^= s;
    }
    block
}

/// Truncated HMAC-SHA1 over the concatenation of `parts`.
pub fn auth_tag(prototype: &HmacSha1, parts: &[&[u8]], tag_len: usize) -> Vec<u8> {
    let mut mac = prototype.clone();
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    digest[..tag_len.min(digest.len())].to_vec()
}

pub fn new_hmac(auth_key: &[u8]) -> SrtpResult<HmacSha1> {
    <HmacSha1 as Mac>::new_from_slice(auth_key).map_err(|_| SrtpError::UnsupportedProfile)
}

/// Constant-time tag comparison. Lengths are public, so a mismatch returns early.
pub fn verify_auth_tag(expected: &[u8], actual: &[u8]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in expected.iter().zip(actual.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn rfc3711_key_derivation_vectors() {
        // RFC 3711 appendix B.3
        let master_key = hex("E1F97A0D3E018BE0D64FA32C06DE4139");
        let master_salt = hex("0EC675AD498AFEEBB6960B3AABE6");

        let enc = derive_session_key(&master_key, &master_salt, LABEL_RTP_ENCRYPTION, 16).unwrap();
        assert_eq!(enc, hex("C61E7A93744F39EE10734AFE3FF7A087"));

        let salt = derive_session_key(&master_key, &master_salt, LABEL_RTP_SALT, 14).unwrap();
        assert_eq!(salt, hex("30CBBC08863D8C85D49DB34A9AE1"));

        let auth = derive_session_key(&master_key, &master_salt, LABEL_RTP_AUTH, 20).unwrap();
        assert_eq!(auth, hex("CEBE321F6FF7716B6FD4AB49AF256A156D38BAA4"));
    }

    #[test]
    fn iv_layout_places_ssrc_and_index() {
        let salt = [0u8; 14];
        let iv = rtp_iv(&salt, 0xCAFEBABE, 1, 0x1234);
        assert_eq!(&iv[4..8], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(&iv[8..14], &[0, 0, 0, 1, 0x12, 0x34]);
        assert_eq!(&iv[14..], &[0, 0]);

        let iv = rtcp_iv(&salt, 0xCAFEBABE, 0x8000_0001);
        assert_eq!(&iv[10..14], &[0, 0, 0, 1]);
    }

    #[test]
    fn tag_comparison_rejects_any_single_byte_change() {
        let tag = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert!(verify_auth_tag(&tag, &tag));
        for i in 0..tag.len() {
            let mut bad = tag;
            bad[i] ^= 0x01;
            assert!(!verify_auth_tag(&tag, &bad));
        }
        assert!(!verify_auth_tag(&tag, &tag[..9]));
    }
}
