//! SMB2 message bodies used by the session handshake
//!
//! Bodies are parsed from the bytes that follow the 64-byte header. Buffer
//! offsets carried inside a body are relative to the start of the header, as
//! on the wire.

pub mod negotiate;
pub mod session;

pub use negotiate::{Smb2NegotiateRequest, Smb2NegotiateResponse};
pub use session::{Smb2SessionSetupRequest, Smb2SessionSetupResponse};

use super::constants::{structure_size, SMB2_HEADER_SIZE};
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Trait for SMB messages that can be parsed from and serialized to bytes
pub trait SmbMessage: Sized {
    /// Parse message from body bytes
    fn parse(buf: &[u8]) -> Result<Self>;

    /// Serialize message to body bytes
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Get the size of the message when serialized
    fn size(&self) -> usize;
}

/// Translate a header-relative buffer offset into a body-relative range,
/// checking it lies within `body`.
pub(crate) fn body_range(
    body: &[u8],
    offset: u16,
    length: u16,
    what: &str,
) -> Result<std::ops::Range<usize>> {
    if length == 0 {
        return Ok(0..0);
    }
    let start = (offset as usize)
        .checked_sub(SMB2_HEADER_SIZE)
        .ok_or_else(|| Error::ParseError(format!("{} offset {} inside header", what, offset)))?;
    let end = start + length as usize;
    if end > body.len() {
        return Err(Error::ParseError(format!(
            "{} extends beyond message ({} > {})",
            what,
            end,
            body.len()
        )));
    }
    Ok(start..end)
}

/// SMB2 ERROR response body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Smb2ErrorResponse;

impl SmbMessage for Smb2ErrorResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::ERROR_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid error response structure size: {}",
                size
            )));
        }
        Ok(Self)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(9);
        buf.write_u16::<LittleEndian>(structure_size::ERROR_RESPONSE)?;
        buf.push(0); // ErrorContextCount
        buf.push(0); // Reserved
        buf.write_u32::<LittleEndian>(0)?; // ByteCount
        buf.push(0); // ErrorData
        Ok(buf)
    }

    fn size(&self) -> usize {
        9
    }
}

/// Body shared by ECHO and LOGOFF requests and responses: a structure size
/// of 4 and two reserved bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Smb2EmptyMessage;

impl SmbMessage for Smb2EmptyMessage {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::ECHO {
            return Err(Error::ParseError(format!(
                "Invalid structure size: {}",
                size
            )));
        }
        Ok(Self)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u16::<LittleEndian>(structure_size::ECHO)?;
        buf.write_u16::<LittleEndian>(0)?;
        Ok(buf)
    }

    fn size(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let bytes = Smb2ErrorResponse.serialize().unwrap();
        assert_eq!(bytes, vec![9, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Smb2ErrorResponse::parse(&bytes).is_ok());
        assert!(Smb2ErrorResponse::parse(&[4, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_body_range() {
        let body = [0u8; 32];
        assert_eq!(body_range(&body, 72, 8, "buf").unwrap(), 8..16);
        assert_eq!(body_range(&body, 0, 0, "buf").unwrap(), 0..0);
        assert!(body_range(&body, 10, 4, "buf").is_err());
        assert!(body_range(&body, 90, 8, "buf").is_err());
    }
}
