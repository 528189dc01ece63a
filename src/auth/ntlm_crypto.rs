//! NTLM cryptographic functions

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::RngCore;

type HmacMd5 = Hmac<Md5>;

/// Length of the NTProofStr at the head of an NTLMv2 response
pub const NT_PROOF_LEN: usize = 16;

/// Difference between the Windows epoch (1601-01-01) and the Unix epoch in
/// 100ns intervals
const WINDOWS_EPOCH_DIFF: i64 = 116_444_736_000_000_000;

fn utf16le(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for ch in s.encode_utf16() {
        out.write_u16::<LittleEndian>(ch)?;
    }
    Ok(out)
}

fn hmac_md5(key: &[u8]) -> Result<HmacMd5> {
    HmacMd5::new_from_slice(key).map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))
}

/// Convert password to NTLM hash (MD4 of UTF-16LE password)
pub fn ntlm_hash(password: &str) -> Result<[u8; 16]> {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password)?);
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&hasher.finalize());
    Ok(hash)
}

/// NTLMv2 hash: HMAC-MD5(nt_hash, UTF16LE(uppercase(user) + domain))
pub fn ntlmv2_hash(nt_hash: &[u8; 16], username: &str, domain: &str) -> Result<[u8; 16]> {
    let identity = format!("{}{}", username.to_uppercase(), domain);
    let mut mac = hmac_md5(nt_hash)?;
    mac.update(&utf16le(&identity)?);

    let mut hash = [0u8; 16];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    Ok(hash)
}

/// NTLMv2 client blob (the "temp" structure of [MS-NLMP] 3.3.2)
#[derive(Debug, Clone)]
pub struct NtlmV2Blob {
    pub timestamp: u64,
    pub client_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl NtlmV2Blob {
    pub fn new(timestamp: u64, client_challenge: [u8; 8], target_info: Vec<u8>) -> Self {
        Self {
            timestamp,
            client_challenge,
            target_info,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(32 + self.target_info.len());
        // Blob signature and reserved
        blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        blob.write_u64::<LittleEndian>(self.timestamp)?;
        blob.extend_from_slice(&self.client_challenge);
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        blob.extend_from_slice(&self.target_info);
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        Ok(blob)
    }
}

/// Calculate the NTLMv2 response: NTProofStr followed by the blob
pub fn ntlmv2_response(
    ntlmv2_hash: &[u8; 16],
    server_challenge: &[u8; 8],
    blob: &NtlmV2Blob,
) -> Result<Vec<u8>> {
    let blob_bytes = blob.to_bytes()?;

    let mut mac = hmac_md5(ntlmv2_hash)?;
    mac.update(server_challenge);
    mac.update(&blob_bytes);

    let mut response = mac.finalize().into_bytes().to_vec();
    response.extend_from_slice(&blob_bytes);
    Ok(response)
}

/// Verify a client's NTLMv2 response against the expected NTLMv2 hash.
///
/// The comparison of the NTProofStr is constant time.
pub fn verify_ntlmv2_response(
    ntlmv2_hash: &[u8; 16],
    server_challenge: &[u8; 8],
    nt_response: &[u8],
) -> Result<bool> {
    if nt_response.len() <= NT_PROOF_LEN {
        return Ok(false);
    }
    let (proof, blob) = nt_response.split_at(NT_PROOF_LEN);

    let mut mac = hmac_md5(ntlmv2_hash)?;
    mac.update(server_challenge);
    mac.update(blob);
    Ok(mac.verify_slice(proof).is_ok())
}

/// Generate a random 8-byte challenge
pub fn generate_challenge() -> [u8; 8] {
    let mut challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Convert a UTC time to a Windows FILETIME (100ns intervals since 1601-01-01)
pub fn to_windows_timestamp(time: DateTime<Utc>) -> u64 {
    let unix_100ns = time.timestamp() * 10_000_000 + i64::from(time.timestamp_subsec_nanos() / 100);
    (unix_100ns + WINDOWS_EPOCH_DIFF).max(0) as u64
}

/// Current time as a Windows FILETIME
pub fn get_windows_timestamp() -> u64 {
    to_windows_timestamp(Utc::now())
}
