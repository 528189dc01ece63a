//! SMB2 SESSION_SETUP messages

use super::{body_range, SmbMessage};
use crate::auth::SecurityBlob;
use crate::error::{Error, Result};
use crate::protocol::constants::{
    structure_size, SecurityMode, SessionFlags, Smb2Capabilities, SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};
use std::ops::Range;

/// SMB2 SESSION_SETUP request.
///
/// The security buffer is not copied out of the message: the request borrows
/// the body it was parsed from and hands out a [`SecurityBlob`] window over
/// it.
#[derive(Debug, Clone)]
pub struct Smb2SessionSetupRequest<'a> {
    pub flags: u8,
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub previous_session_id: u64,
    body: &'a [u8],
    security: Range<usize>,
}

impl<'a> Smb2SessionSetupRequest<'a> {
    /// Fixed part of the body before the security buffer
    const FIXED_SIZE: usize = 24;

    pub fn parse(body: &'a [u8]) -> Result<Self> {
        if body.len() < Self::FIXED_SIZE {
            return Err(Error::ParseError("SessionSetup request too short".into()));
        }

        let mut cursor = io::Cursor::new(body);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::SESSION_SETUP_REQUEST {
            return Err(Error::ParseError(format!(
                "Invalid SessionSetup request structure size: {}",
                size
            )));
        }

        let flags = cursor.read_u8()?;
        let security_mode = SecurityMode::from_bits_retain(cursor.read_u8()? as u16);
        let capabilities = Smb2Capabilities::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let _channel = cursor.read_u32::<LittleEndian>()?;
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()?;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()?;
        let previous_session_id = cursor.read_u64::<LittleEndian>()?;

        let security = body_range(
            body,
            security_buffer_offset,
            security_buffer_length,
            "Security buffer",
        )?;

        Ok(Self {
            flags,
            security_mode,
            capabilities,
            previous_session_id,
            body,
            security,
        })
    }

    /// The client's token as a classified window over the request body
    pub fn security_blob(&self, unicode: bool) -> Result<SecurityBlob<'a>> {
        SecurityBlob::classified(
            self.body,
            self.security.start,
            self.security.len(),
            unicode,
        )
    }

    pub fn security_bytes(&self) -> &'a [u8] {
        &self.body[self.security.clone()]
    }

    /// Encode a request body carrying `security_blob`
    pub fn encode(security_blob: &[u8], previous_session_id: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + security_blob.len());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_REQUEST)?;
        buf.write_u8(0)?;
        buf.write_u8(SecurityMode::SIGNING_ENABLED.bits() as u8)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16)?;
        buf.write_u16::<LittleEndian>(security_blob.len() as u16)?;
        buf.write_u64::<LittleEndian>(previous_session_id)?;
        buf.write_all(security_blob)?;
        Ok(buf)
    }
}

/// SMB2 SESSION_SETUP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2SessionSetupResponse {
    pub session_flags: SessionFlags,
    pub security_blob: Vec<u8>,
}

impl Smb2SessionSetupResponse {
    const FIXED_SIZE: usize = 8;

    pub fn new(session_flags: SessionFlags, security_blob: Vec<u8>) -> Self {
        Self {
            session_flags,
            security_blob,
        }
    }
}

impl SmbMessage for Smb2SessionSetupResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::ParseError("SessionSetup response too short".into()));
        }

        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::SESSION_SETUP_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid SessionSetup response structure size: {}",
                size
            )));
        }

        let session_flags = SessionFlags::from_bits_retain(cursor.read_u16::<LittleEndian>()?);
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()?;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()?;
        let range = body_range(
            buf,
            security_buffer_offset,
            security_buffer_length,
            "Security buffer",
        )?;

        Ok(Self {
            session_flags,
            security_blob: buf[range].to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.session_flags.bits())?;

        let security_buffer_offset = if self.security_blob.is_empty() {
            0
        } else {
            (SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16
        };
        buf.write_u16::<LittleEndian>(security_buffer_offset)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        buf.write_all(&self.security_blob)?;
        Ok(buf)
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.security_blob.len()
    }
}
