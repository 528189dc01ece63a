//! NetBIOS over TCP (NBT) session service framing
//!
//! Implements the 4-byte session service header of RFC 1001/1002. Direct TCP
//! (port 445) uses the same framing with only session messages.

use crate::error::{Error, Result};
use std::convert::TryFrom;

/// NetBIOS session service message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetBiosMessageType {
    SessionMessage = 0x00,
    SessionRequest = 0x81,
    PositiveResponse = 0x82,
    NegativeResponse = 0x83,
    RetargetResponse = 0x84,
    Keepalive = 0x85,
}

impl TryFrom<u8> for NetBiosMessageType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NetBiosMessageType::SessionMessage),
            0x81 => Ok(NetBiosMessageType::SessionRequest),
            0x82 => Ok(NetBiosMessageType::PositiveResponse),
            0x83 => Ok(NetBiosMessageType::NegativeResponse),
            0x84 => Ok(NetBiosMessageType::RetargetResponse),
            0x85 => Ok(NetBiosMessageType::Keepalive),
            _ => Err(Error::Protocol(format!(
                "Invalid NetBIOS message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// NetBIOS Session Service header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetBiosHeader {
    pub message_type: NetBiosMessageType,
    /// Length of the message payload (17 bits max)
    pub length: u32,
}

impl NetBiosHeader {
    /// Maximum payload length (17 bits)
    pub const MAX_LENGTH: u32 = 0x1FFFF;

    /// Header size in bytes
    pub const SIZE: usize = 4;

    pub fn new(message_type: NetBiosMessageType, length: u32) -> Result<Self> {
        if length > Self::MAX_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "NetBIOS length {} exceeds maximum {}",
                length,
                Self::MAX_LENGTH
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        let message_type = NetBiosMessageType::try_from(buf[0])?;

        // Length is in the lower 17 bits of bytes 1-3
        let length = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32);

        Ok(Self {
            message_type,
            length: length & Self::MAX_LENGTH,
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.message_type as u8,
            ((self.length >> 16) & 0x01) as u8,
            ((self.length >> 8) & 0xFF) as u8,
            (self.length & 0xFF) as u8,
        ]
    }
}
