//! SMB2 packet header

use super::constants::{header_flags, structure_size, Smb2Command, SMB2_HEADER_SIZE, SMB2_PROTOCOL_ID};
use crate::error::{Error, NtStatus, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{self, Read};

/// SMB2 sync header (64 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: u32,
    pub command: Smb2Command,
    pub credits: u16,
    pub flags: u32,
    pub next_command: u32,
    pub message_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            credit_charge: 0,
            status: 0,
            command,
            credits: 1,
            flags: 0,
            next_command: 0,
            message_id: 0,
            process_id: 0,
            tree_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    /// Header of the response to `request`
    pub fn response_to(request: &Smb2Header, status: NtStatus, session_id: u64) -> Self {
        Self {
            credit_charge: request.credit_charge,
            status: status as u32,
            command: request.command,
            credits: request.credits.max(1),
            flags: header_flags::RESPONSE,
            next_command: 0,
            message_id: request.message_id,
            process_id: request.process_id,
            tree_id: request.tree_id,
            session_id,
            signature: [0; 16],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        let mut cursor = io::Cursor::new(buf);
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        if protocol_id != SMB2_PROTOCOL_ID {
            return Err(Error::InvalidHeader(format!(
                "Invalid protocol ID: 0x{:08x}",
                protocol_id
            )));
        }
        let header_size = cursor.read_u16::<LittleEndian>()?;
        if header_size != structure_size::HEADER {
            return Err(Error::InvalidHeader(format!(
                "Invalid header structure size: {}",
                header_size
            )));
        }

        let credit_charge = cursor.read_u16::<LittleEndian>()?;
        let status = cursor.read_u32::<LittleEndian>()?;
        let command = Smb2Command::try_from(cursor.read_u16::<LittleEndian>()?)?;
        let credits = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let next_command = cursor.read_u32::<LittleEndian>()?;
        let message_id = cursor.read_u64::<LittleEndian>()?;
        let process_id = cursor.read_u32::<LittleEndian>()?;
        let tree_id = cursor.read_u32::<LittleEndian>()?;
        let session_id = cursor.read_u64::<LittleEndian>()?;
        let mut signature = [0u8; 16];
        cursor.read_exact(&mut signature)?;

        Ok(Self {
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            process_id,
            tree_id,
            session_id,
            signature,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(SMB2_PROTOCOL_ID)?;
        buf.write_u16::<LittleEndian>(structure_size::HEADER)?;
        buf.write_u16::<LittleEndian>(self.credit_charge)?;
        buf.write_u32::<LittleEndian>(self.status)?;
        buf.write_u16::<LittleEndian>(self.command as u16)?;
        buf.write_u16::<LittleEndian>(self.credits)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(self.next_command)?;
        buf.write_u64::<LittleEndian>(self.message_id)?;
        buf.write_u32::<LittleEndian>(self.process_id)?;
        buf.write_u32::<LittleEndian>(self.tree_id)?;
        buf.write_u64::<LittleEndian>(self.session_id)?;
        buf.extend_from_slice(&self.signature);
        Ok(buf)
    }

    pub fn is_response(&self) -> bool {
        self.flags & header_flags::RESPONSE != 0
    }

    /// Status as a known code, if it is one
    pub fn nt_status(&self) -> Option<NtStatus> {
        NtStatus::try_from(self.status).ok()
    }
}
