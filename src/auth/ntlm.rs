//! NTLMSSP message codec
//!
//! Parses and builds the three NTLM messages ([MS-NLMP] 2.2.1) exchanged
//! during a handshake: NEGOTIATE (client), CHALLENGE (server) and
//! AUTHENTICATE (client). Only the fields the server side needs are decoded;
//! the version structure and MIC are carried through untouched.

use super::ntlm_crypto;
use crate::error::{Error, Result};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{self, Read, Write};

/// NTLM signature - "NTLMSSP\0"
pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// NTLM message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtlmMessageType {
    /// Type 1: Negotiate message (client -> server)
    Negotiate = 0x00000001,
    /// Type 2: Challenge message (server -> client)
    Challenge = 0x00000002,
    /// Type 3: Authenticate message (client -> server)
    Authenticate = 0x00000003,
}

impl TryFrom<u32> for NtlmMessageType {
    type Error = Error;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000001 => Ok(Self::Negotiate),
            0x00000002 => Ok(Self::Challenge),
            0x00000003 => Ok(Self::Authenticate),
            _ => Err(Error::ParseError(format!(
                "Invalid NTLM message type: {}",
                value
            ))),
        }
    }
}

bitflags! {
    /// NTLM negotiation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NtlmFlags: u32 {
        const NEGOTIATE_UNICODE = 0x00000001;
        const NEGOTIATE_OEM = 0x00000002;
        const REQUEST_TARGET = 0x00000004;
        const NEGOTIATE_SIGN = 0x00000010;
        const NEGOTIATE_SEAL = 0x00000020;
        const NEGOTIATE_LM_KEY = 0x00000080;
        const NEGOTIATE_NTLM = 0x00000200;
        const NEGOTIATE_ANONYMOUS = 0x00000800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x00001000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x00002000;
        const NEGOTIATE_ALWAYS_SIGN = 0x00008000;
        const TARGET_TYPE_DOMAIN = 0x00010000;
        const TARGET_TYPE_SERVER = 0x00020000;
        const NEGOTIATE_EXTENDED_SECURITY = 0x00080000;
        const NEGOTIATE_TARGET_INFO = 0x00800000;
        const NEGOTIATE_VERSION = 0x02000000;
        const NEGOTIATE_128 = 0x20000000;
        const NEGOTIATE_KEY_EXCHANGE = 0x40000000;
        const NEGOTIATE_56 = 0x80000000;
    }
}

/// Read the message type of an NTLMSSP message without decoding the rest.
pub fn peek_message_type(data: &[u8]) -> Result<NtlmMessageType> {
    if data.len() < 12 {
        return Err(Error::BufferTooSmall {
            need: 12,
            have: data.len(),
        });
    }
    if &data[0..8] != NTLMSSP_SIGNATURE {
        return Err(Error::ParseError("Invalid NTLM signature".into()));
    }
    let mut cursor = io::Cursor::new(&data[8..12]);
    NtlmMessageType::try_from(cursor.read_u32::<LittleEndian>()?)
}

/// Security buffer descriptor (length, allocated length, offset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityBuffer {
    pub length: u16,
    pub max_length: u16,
    /// Offset from the beginning of the NTLM message
    pub offset: u32,
}

impl SecurityBuffer {
    pub fn with_data(data_len: usize, offset: usize) -> Self {
        Self {
            length: data_len as u16,
            max_length: data_len as u16,
            offset: offset as u32,
        }
    }

    pub fn parse(cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let length = cursor.read_u16::<LittleEndian>()?;
        let max_length = cursor.read_u16::<LittleEndian>()?;
        let offset = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            length,
            max_length,
            offset,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<LittleEndian>(self.length)?;
        buf.write_u16::<LittleEndian>(self.max_length)?;
        buf.write_u32::<LittleEndian>(self.offset)?;
        Ok(())
    }

    pub fn extract_data<'a>(&self, message: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + self.length as usize;

        message.get(start..end).ok_or_else(|| {
            Error::ParseError("Security buffer extends beyond message".into())
        })
    }
}

/// Encode a string as UTF-16LE or OEM bytes depending on the negotiated flags.
fn encode_string(s: &str, unicode: bool) -> Vec<u8> {
    if unicode {
        s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
    } else {
        s.as_bytes().to_vec()
    }
}

fn decode_string(bytes: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Check the signature and expected type at the head of a message.
fn read_preamble(cursor: &mut io::Cursor<&[u8]>, expected: NtlmMessageType) -> Result<()> {
    let mut signature = [0u8; 8];
    cursor.read_exact(&mut signature)?;
    if &signature != NTLMSSP_SIGNATURE {
        return Err(Error::ParseError("Invalid NTLM signature".into()));
    }

    let message_type = NtlmMessageType::try_from(cursor.read_u32::<LittleEndian>()?)?;
    if message_type != expected {
        return Err(Error::ParseError(format!(
            "Expected NTLM {:?} message, got {:?}",
            expected, message_type
        )));
    }
    Ok(())
}

/// NTLM Type 1 Message - Negotiate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmNegotiateMessage {
    pub flags: NtlmFlags,
    pub domain_name: String,
    pub workstation_name: String,
}

impl NtlmNegotiateMessage {
    pub fn new(domain: String, workstation: String) -> Self {
        Self {
            flags: NtlmFlags::NEGOTIATE_UNICODE
                | NtlmFlags::NEGOTIATE_NTLM
                | NtlmFlags::REQUEST_TARGET
                | NtlmFlags::NEGOTIATE_EXTENDED_SECURITY
                | NtlmFlags::NEGOTIATE_ALWAYS_SIGN
                | NtlmFlags::NEGOTIATE_128
                | NtlmFlags::NEGOTIATE_56,
            domain_name: domain,
            workstation_name: workstation,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::ParseError("NTLM negotiate message too short".into()));
        }

        let mut cursor = io::Cursor::new(data);
        read_preamble(&mut cursor, NtlmMessageType::Negotiate)?;
        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);

        // Domain and workstation buffers are optional and always OEM encoded
        if data.len() < 32 {
            return Ok(Self {
                flags,
                domain_name: String::new(),
                workstation_name: String::new(),
            });
        }
        let domain = SecurityBuffer::parse(&mut cursor)?;
        let workstation = SecurityBuffer::parse(&mut cursor)?;

        Ok(Self {
            flags,
            domain_name: decode_string(domain.extract_data(data)?, false),
            workstation_name: decode_string(workstation.extract_data(data)?, false),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Negotiate as u32)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;

        let domain = self.domain_name.as_bytes();
        let workstation = self.workstation_name.as_bytes();
        let mut offset = 32;
        SecurityBuffer::with_data(domain.len(), offset).serialize(&mut buf)?;
        offset += domain.len();
        SecurityBuffer::with_data(workstation.len(), offset).serialize(&mut buf)?;

        buf.write_all(domain)?;
        buf.write_all(workstation)?;
        Ok(buf)
    }
}

/// Attribute-value pair identifiers used in the challenge target info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AvId {
    Eol = 0x0000,
    NbComputerName = 0x0001,
    NbDomainName = 0x0002,
    DnsComputerName = 0x0003,
    DnsDomainName = 0x0004,
    Timestamp = 0x0007,
}

/// Builder for the AV_PAIR list carried in the CHALLENGE target info field
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    buf: Vec<u8>,
}

impl TargetInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target info advertised by a standalone server
    pub fn for_server(domain: &str, computer: &str, timestamp: u64) -> Result<Vec<u8>> {
        let mut info = Self::new();
        info.push(AvId::NbDomainName, &encode_string(domain, true))?;
        info.push(AvId::NbComputerName, &encode_string(computer, true))?;
        info.push(AvId::DnsDomainName, &encode_string(domain, true))?;
        info.push(AvId::DnsComputerName, &encode_string(computer, true))?;
        info.push(AvId::Timestamp, &timestamp.to_le_bytes())?;
        info.finish()
    }

    pub fn push(&mut self, id: AvId, value: &[u8]) -> Result<()> {
        self.buf.write_u16::<LittleEndian>(id as u16)?;
        self.buf.write_u16::<LittleEndian>(value.len() as u16)?;
        self.buf.write_all(value)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.push(AvId::Eol, &[])?;
        Ok(self.buf)
    }
}

/// NTLM Type 2 Message - Challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallengeMessage {
    pub flags: NtlmFlags,
    pub challenge: [u8; 8],
    pub target_name: String,
    pub target_info: Vec<u8>,
}

impl NtlmChallengeMessage {
    pub fn new(target_name: String, challenge: [u8; 8], target_info: Vec<u8>) -> Self {
        Self {
            flags: NtlmFlags::NEGOTIATE_UNICODE
                | NtlmFlags::NEGOTIATE_NTLM
                | NtlmFlags::REQUEST_TARGET
                | NtlmFlags::TARGET_TYPE_DOMAIN
                | NtlmFlags::NEGOTIATE_TARGET_INFO
                | NtlmFlags::NEGOTIATE_EXTENDED_SECURITY,
            challenge,
            target_name,
            target_info,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 48 {
            return Err(Error::ParseError("NTLM challenge message too short".into()));
        }

        let mut cursor = io::Cursor::new(data);
        read_preamble(&mut cursor, NtlmMessageType::Challenge)?;
        let target_name = SecurityBuffer::parse(&mut cursor)?;
        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let mut challenge = [0u8; 8];
        cursor.read_exact(&mut challenge)?;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        let target_info = SecurityBuffer::parse(&mut cursor)?;

        let unicode = flags.contains(NtlmFlags::NEGOTIATE_UNICODE);
        Ok(Self {
            flags,
            challenge,
            target_name: decode_string(target_name.extract_data(data)?, unicode),
            target_info: target_info.extract_data(data)?.to_vec(),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let unicode = self.flags.contains(NtlmFlags::NEGOTIATE_UNICODE);
        let target_name = encode_string(&self.target_name, unicode);

        let mut buf = Vec::with_capacity(48 + target_name.len() + self.target_info.len());
        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Challenge as u32)?;

        let mut offset = 48;
        SecurityBuffer::with_data(target_name.len(), offset).serialize(&mut buf)?;
        offset += target_name.len();

        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_all(&self.challenge)?;
        buf.write_u64::<LittleEndian>(0)?;
        SecurityBuffer::with_data(self.target_info.len(), offset).serialize(&mut buf)?;

        buf.write_all(&target_name)?;
        buf.write_all(&self.target_info)?;
        Ok(buf)
    }
}

/// NTLM Type 3 Message - Authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmAuthenticateMessage {
    pub flags: NtlmFlags,
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub domain_name: String,
    pub user_name: String,
    pub workstation: String,
    pub session_key: Vec<u8>,
}

impl NtlmAuthenticateMessage {
    /// Fixed header length: signature, type, six buffers and flags
    const FIXED_SIZE: usize = 64;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(Error::ParseError(
                "NTLM authenticate message too short".into(),
            ));
        }

        let mut cursor = io::Cursor::new(data);
        read_preamble(&mut cursor, NtlmMessageType::Authenticate)?;

        let lm_response = SecurityBuffer::parse(&mut cursor)?;
        let nt_response = SecurityBuffer::parse(&mut cursor)?;
        let domain = SecurityBuffer::parse(&mut cursor)?;
        let user = SecurityBuffer::parse(&mut cursor)?;
        let workstation = SecurityBuffer::parse(&mut cursor)?;
        let session_key = SecurityBuffer::parse(&mut cursor)?;
        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);

        let unicode = flags.contains(NtlmFlags::NEGOTIATE_UNICODE);
        Ok(Self {
            flags,
            lm_response: lm_response.extract_data(data)?.to_vec(),
            nt_response: nt_response.extract_data(data)?.to_vec(),
            domain_name: decode_string(domain.extract_data(data)?, unicode),
            user_name: decode_string(user.extract_data(data)?, unicode),
            workstation: decode_string(workstation.extract_data(data)?, unicode),
            session_key: session_key.extract_data(data)?.to_vec(),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let unicode = self.flags.contains(NtlmFlags::NEGOTIATE_UNICODE);
        let fields: [Vec<u8>; 6] = [
            self.lm_response.clone(),
            self.nt_response.clone(),
            encode_string(&self.domain_name, unicode),
            encode_string(&self.user_name, unicode),
            encode_string(&self.workstation, unicode),
            self.session_key.clone(),
        ];

        let mut buf = Vec::new();
        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Authenticate as u32)?;

        let mut offset = Self::FIXED_SIZE;
        for field in &fields {
            SecurityBuffer::with_data(field.len(), offset).serialize(&mut buf)?;
            offset += field.len();
        }
        buf.write_u32::<LittleEndian>(self.flags.bits())?;

        for field in &fields {
            buf.write_all(field)?;
        }
        Ok(buf)
    }

    /// Build the NTLMv2 answer to `challenge` for the given credentials, as a
    /// client would.
    pub fn respond(
        challenge: &NtlmChallengeMessage,
        user_name: &str,
        domain_name: &str,
        password: &str,
        client_challenge: [u8; 8],
    ) -> Result<Self> {
        let nt_hash = ntlm_crypto::ntlm_hash(password)?;
        let v2_hash = ntlm_crypto::ntlmv2_hash(&nt_hash, user_name, domain_name)?;
        let blob = ntlm_crypto::NtlmV2Blob::new(
            ntlm_crypto::get_windows_timestamp(),
            client_challenge,
            challenge.target_info.clone(),
        );
        let nt_response = ntlm_crypto::ntlmv2_response(&v2_hash, &challenge.challenge, &blob)?;

        Ok(Self {
            flags: challenge.flags,
            lm_response: vec![0; 24],
            nt_response,
            domain_name: domain_name.to_string(),
            user_name: user_name.to_string(),
            workstation: String::new(),
            session_key: Vec::new(),
        })
    }

    /// An anonymous logon carries no user name and no NT response.
    pub fn is_anonymous(&self) -> bool {
        self.user_name.is_empty() && self.nt_response.is_empty()
    }
}
