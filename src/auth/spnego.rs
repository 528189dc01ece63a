//! Minimal SPNEGO ([RFC 4178]) DER handling
//!
//! Only the structures needed to carry NTLMSSP are understood: the initial
//! `NegTokenInit` wrapped in a GSS-API `InitialContextToken`, and
//! `NegTokenResp` for every later leg.

use super::blob::SecurityBlob;
use super::SpnegoDecoder;
use crate::error::{Error, Result};

/// SPNEGO mechanism OID 1.3.6.1.5.5.2
pub const SPNEGO_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];

/// NTLMSSP mechanism OID 1.3.6.1.4.1.311.2.2.10
pub const NTLMSSP_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

const TAG_APPLICATION_0: u8 = 0x60;
const TAG_NEG_TOKEN_INIT: u8 = 0xa0;
const TAG_NEG_TOKEN_RESP: u8 = 0xa1;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_OID: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0a;
/// Context tag of `mechToken` in NegTokenInit and `responseToken` in NegTokenResp
const TAG_MECH_TOKEN: u8 = 0xa2;

/// NegTokenResp negState values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegState {
    AcceptCompleted = 0,
    AcceptIncomplete = 1,
    Reject = 2,
    RequestMic = 3,
}

/// A decoded tag-length header; `start..end` is the content range.
#[derive(Debug, Clone, Copy)]
struct Tlv {
    tag: u8,
    start: usize,
    end: usize,
}

fn read_tlv(buf: &[u8], pos: usize) -> Result<Tlv> {
    let short = |need| Error::BufferTooSmall {
        need,
        have: buf.len(),
    };
    let tag = *buf.get(pos).ok_or_else(|| short(pos + 1))?;
    let first = *buf.get(pos + 1).ok_or_else(|| short(pos + 2))?;

    let (len, header) = if first < 0x80 {
        (first as usize, 2)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(Error::ParseError(format!(
                "Unsupported DER length form 0x{:02x}",
                first
            )));
        }
        let bytes = buf
            .get(pos + 2..pos + 2 + count)
            .ok_or_else(|| short(pos + 2 + count))?;
        let len = bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, 2 + count)
    };

    let start = pos + header;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| short(start.saturating_add(len)))?;
    Ok(Tlv { tag, start, end })
}

fn expect_tlv(buf: &[u8], pos: usize, tag: u8) -> Result<Tlv> {
    let tlv = read_tlv(buf, pos)?;
    if tlv.tag != tag {
        return Err(Error::ParseError(format!(
            "Expected DER tag 0x{:02x}, found 0x{:02x}",
            tag, tlv.tag
        )));
    }
    Ok(tlv)
}

/// Find a direct child of a constructed value by tag.
fn find_child(buf: &[u8], parent: &Tlv, tag: u8) -> Result<Option<Tlv>> {
    let mut pos = parent.start;
    while pos < parent.end {
        let child = read_tlv(&buf[..parent.end], pos)?;
        if child.tag == tag {
            return Ok(Some(child));
        }
        pos = child.end;
    }
    Ok(None)
}

/// Locate the mechanism token inside a SPNEGO token, returning its range.
fn mech_token_range(data: &[u8]) -> Result<(usize, usize)> {
    let outer = read_tlv(data, 0)?;
    let body = match outer.tag {
        TAG_APPLICATION_0 => {
            let oid = expect_tlv(data, outer.start, TAG_OID)?;
            if &data[oid.start..oid.end] != SPNEGO_OID {
                return Err(Error::ParseError("Not a SPNEGO mechanism OID".into()));
            }
            let choice = expect_tlv(data, oid.end, TAG_NEG_TOKEN_INIT)?;
            expect_tlv(data, choice.start, TAG_SEQUENCE)?
        }
        TAG_NEG_TOKEN_RESP => expect_tlv(data, outer.start, TAG_SEQUENCE)?,
        other => {
            return Err(Error::ParseError(format!(
                "Unrecognised SPNEGO token tag 0x{:02x}",
                other
            )))
        }
    };

    let mech = find_child(data, &body, TAG_MECH_TOKEN)?
        .ok_or_else(|| Error::ParseError("SPNEGO token carries no mechanism token".into()))?;
    let octets = expect_tlv(&data[..mech.end], mech.start, TAG_OCTET_STRING)?;
    Ok((octets.start, octets.end - octets.start))
}

fn push_der_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        buf.push(0x80 | (4 - skip) as u8);
        buf.extend_from_slice(&bytes[skip..]);
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    push_der_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

/// Encode a GSS-API wrapped `NegTokenInit` offering NTLMSSP, optionally
/// carrying a first mechanism token.
pub fn encode_neg_token_init(mech_token: Option<&[u8]>) -> Vec<u8> {
    let mech_types = der(TAG_SEQUENCE, &der(TAG_OID, NTLMSSP_OID));
    let mut fields = der(0xa0, &mech_types);
    if let Some(token) = mech_token {
        fields.extend(der(TAG_MECH_TOKEN, &der(TAG_OCTET_STRING, token)));
    }
    let neg_token_init = der(TAG_NEG_TOKEN_INIT, &der(TAG_SEQUENCE, &fields));

    let mut inner = der(TAG_OID, SPNEGO_OID);
    inner.extend(neg_token_init);
    der(TAG_APPLICATION_0, &inner)
}

/// Encode a `NegTokenResp`
pub fn encode_neg_token_resp(
    state: Option<NegState>,
    supported_mech: bool,
    response_token: Option<&[u8]>,
) -> Vec<u8> {
    let mut fields = Vec::new();
    if let Some(state) = state {
        fields.extend(der(0xa0, &der(TAG_ENUMERATED, &[state as u8])));
    }
    if supported_mech {
        fields.extend(der(0xa1, &der(TAG_OID, NTLMSSP_OID)));
    }
    if let Some(token) = response_token {
        fields.extend(der(TAG_MECH_TOKEN, &der(TAG_OCTET_STRING, token)));
    }
    der(TAG_NEG_TOKEN_RESP, &der(TAG_SEQUENCE, &fields))
}

/// The `NegTokenInit` hint advertised in a NEGOTIATE response
pub fn build_neg_token_init() -> Vec<u8> {
    encode_neg_token_init(None)
}

/// DER based [`SpnegoDecoder`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DerSpnegoDecoder;

impl SpnegoDecoder for DerSpnegoDecoder {
    fn unwrap<'a>(&self, token: &SecurityBlob<'a>) -> Result<SecurityBlob<'a>> {
        let (offset, length) = mech_token_range(token.as_bytes())?;
        token.sub_window(offset, length)
    }

    fn wrap_continue(&self, response: &[u8]) -> Vec<u8> {
        encode_neg_token_resp(Some(NegState::AcceptIncomplete), true, Some(response))
    }

    fn wrap_accept(&self) -> Vec<u8> {
        encode_neg_token_resp(Some(NegState::AcceptCompleted), false, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::blob::{classify, SecurityBlobType};

    const NTLM_TYPE1: &[u8] = b"NTLMSSP\0\x01\x00\x00\x00\x07\x82\x08\xa2";

    fn blob(data: &[u8]) -> SecurityBlob<'_> {
        SecurityBlob::from_slice(classify(data, 0), data, true)
    }

    #[test]
    fn test_unwrap_neg_token_init() {
        let token = encode_neg_token_init(Some(NTLM_TYPE1));
        let outer = blob(&token);
        assert_eq!(outer.blob_type(), SecurityBlobType::Spnego);

        let inner = DerSpnegoDecoder.unwrap(&outer).unwrap();
        assert!(inner.is_ntlmssp());
        assert_eq!(inner.as_bytes(), NTLM_TYPE1);
        assert!(std::ptr::eq(inner.buffer(), outer.buffer()));
    }

    #[test]
    fn test_unwrap_neg_token_resp() {
        let token = encode_neg_token_resp(None, false, Some(NTLM_TYPE1));
        let inner = DerSpnegoDecoder.unwrap(&blob(&token)).unwrap();
        assert_eq!(inner.as_bytes(), NTLM_TYPE1);
    }

    #[test]
    fn test_unwrap_long_form_lengths() {
        let mut big = NTLM_TYPE1.to_vec();
        big.resize(600, 0x5a);
        let token = encode_neg_token_init(Some(&big));
        assert_eq!(token[1], 0x82);

        let inner = DerSpnegoDecoder.unwrap(&blob(&token)).unwrap();
        assert_eq!(inner.len(), 600);
    }

    #[test]
    fn test_unwrap_within_larger_buffer() {
        let token = encode_neg_token_resp(None, false, Some(NTLM_TYPE1));
        let mut frame = vec![0xFF; 10];
        frame.extend_from_slice(&token);
        frame.extend_from_slice(&[0xEE; 7]);

        let outer =
            SecurityBlob::new(SecurityBlobType::Spnego, &frame, 10, token.len(), true).unwrap();
        let inner = DerSpnegoDecoder.unwrap(&outer).unwrap();
        assert_eq!(inner.as_bytes(), NTLM_TYPE1);
        assert!(inner.offset() > 10);
    }

    #[test]
    fn test_unwrap_failures() {
        // Hint without a mechanism token
        let hint = build_neg_token_init();
        assert!(DerSpnegoDecoder.unwrap(&blob(&hint)).is_err());

        // Garbage, truncated and empty input
        assert!(DerSpnegoDecoder.unwrap(&blob(b"\x01\x02\x03\x04")).is_err());
        let token = encode_neg_token_init(Some(NTLM_TYPE1));
        assert!(DerSpnegoDecoder.unwrap(&blob(&token[..token.len() - 3])).is_err());
        assert!(DerSpnegoDecoder.unwrap(&blob(b"")).is_err());

        // Wrong mechanism OID
        let mut wrong = token.clone();
        wrong[4 + SPNEGO_OID.len() - 1] ^= 0xFF;
        assert!(DerSpnegoDecoder.unwrap(&blob(&wrong)).is_err());
    }

    #[test]
    fn test_wrap_accept_completed() {
        assert_eq!(
            DerSpnegoDecoder.wrap_accept(),
            vec![0xa1, 0x07, 0x30, 0x05, 0xa0, 0x03, 0x0a, 0x01, 0x00]
        );
    }

    #[test]
    fn test_wrap_continue_carries_mechanism() {
        let wrapped = DerSpnegoDecoder.wrap_continue(NTLM_TYPE1);
        assert_eq!(wrapped[0], TAG_NEG_TOKEN_RESP);
        assert!(wrapped
            .windows(NTLMSSP_OID.len())
            .any(|w| w == NTLMSSP_OID));

        let inner = DerSpnegoDecoder.unwrap(&blob(&wrapped)).unwrap();
        assert_eq!(inner.as_bytes(), NTLM_TYPE1);
    }
}
