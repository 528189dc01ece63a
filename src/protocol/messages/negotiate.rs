//! SMB2 NEGOTIATE messages

use super::{body_range, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::constants::{
    structure_size, SecurityMode, Smb2Capabilities, Smb2Dialect, DEFAULT_MAX_IO_SIZE,
    SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use uuid::Uuid;

/// SMB2 NEGOTIATE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateRequest {
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub client_guid: Uuid,
    /// Offered dialect revisions, including ones this server does not know
    pub dialects: Vec<u16>,
}

impl Smb2NegotiateRequest {
    pub fn new(dialects: &[Smb2Dialect]) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::empty(),
            client_guid: Uuid::new_v4(),
            dialects: dialects.iter().map(|d| d.to_u16()).collect(),
        }
    }

    /// Pick the most preferred dialect both sides support
    pub fn select_dialect(&self) -> Option<Smb2Dialect> {
        Smb2Dialect::SUPPORTED
            .iter()
            .copied()
            .find(|d| self.dialects.contains(&d.to_u16()))
    }
}

impl SmbMessage for Smb2NegotiateRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::ParseError("Negotiate request too short".into()));
        }

        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::NEGOTIATE_REQUEST {
            return Err(Error::ParseError(format!(
                "Invalid negotiate request structure size: {}",
                size
            )));
        }

        let dialect_count = cursor.read_u16::<LittleEndian>()?;
        let security_mode = SecurityMode::from_bits_retain(cursor.read_u16::<LittleEndian>()?);
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let capabilities = Smb2Capabilities::from_bits_retain(cursor.read_u32::<LittleEndian>()?);

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let _client_start_time = cursor.read_u64::<LittleEndian>()?;

        let mut dialects = Vec::with_capacity(dialect_count as usize);
        for _ in 0..dialect_count {
            dialects.push(cursor.read_u16::<LittleEndian>()?);
        }

        Ok(Self {
            security_mode,
            capabilities,
            client_guid: Uuid::from_bytes(guid_bytes),
            dialects,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.dialects.len() as u16)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_all(self.client_guid.as_bytes())?;
        buf.write_u64::<LittleEndian>(0)?;
        for dialect in &self.dialects {
            buf.write_u16::<LittleEndian>(*dialect)?;
        }
        Ok(buf)
    }

    fn size(&self) -> usize {
        36 + self.dialects.len() * 2
    }
}

/// SMB2 NEGOTIATE response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect: Smb2Dialect,
    pub server_guid: Uuid,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub server_start_time: u64,
    /// Mechanism hint (a SPNEGO NegTokenInit)
    pub security_blob: Vec<u8>,
}

impl Smb2NegotiateResponse {
    /// Fixed part of the body before the security buffer
    const FIXED_SIZE: usize = 64;

    pub fn new(dialect: Smb2Dialect, server_guid: Uuid) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            dialect,
            server_guid,
            capabilities: Smb2Capabilities::empty(),
            max_transact_size: DEFAULT_MAX_IO_SIZE,
            max_read_size: DEFAULT_MAX_IO_SIZE,
            max_write_size: DEFAULT_MAX_IO_SIZE,
            system_time: 0,
            server_start_time: 0,
            security_blob: Vec::new(),
        }
    }
}

impl SmbMessage for Smb2NegotiateResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::ParseError("Negotiate response too short".into()));
        }

        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::NEGOTIATE_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid negotiate response structure size: {}",
                size
            )));
        }

        let security_mode = SecurityMode::from_bits_retain(cursor.read_u16::<LittleEndian>()?);
        let dialect_value = cursor.read_u16::<LittleEndian>()?;
        let dialect = Smb2Dialect::from_u16(dialect_value).ok_or_else(|| {
            Error::ParseError(format!("Unknown SMB2 dialect: 0x{:04x}", dialect_value))
        })?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;

        let capabilities = Smb2Capabilities::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let max_transact_size = cursor.read_u32::<LittleEndian>()?;
        let max_read_size = cursor.read_u32::<LittleEndian>()?;
        let max_write_size = cursor.read_u32::<LittleEndian>()?;
        let system_time = cursor.read_u64::<LittleEndian>()?;
        let server_start_time = cursor.read_u64::<LittleEndian>()?;
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()?;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()?;

        let range = body_range(
            buf,
            security_buffer_offset,
            security_buffer_length,
            "Security buffer",
        )?;

        Ok(Self {
            security_mode,
            dialect,
            server_guid: Uuid::from_bytes(guid_bytes),
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_blob: buf[range].to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(self.dialect.to_u16())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_all(self.server_guid.as_bytes())?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(self.max_transact_size)?;
        buf.write_u32::<LittleEndian>(self.max_read_size)?;
        buf.write_u32::<LittleEndian>(self.max_write_size)?;
        buf.write_u64::<LittleEndian>(self.system_time)?;
        buf.write_u64::<LittleEndian>(self.server_start_time)?;

        let security_buffer_offset = if self.security_blob.is_empty() {
            0
        } else {
            (SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16
        };
        buf.write_u16::<LittleEndian>(security_buffer_offset)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.security_blob)?;

        Ok(buf)
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.security_blob.len()
    }
}
