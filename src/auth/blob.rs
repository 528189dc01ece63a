//! Security blobs exchanged during session setup
//!
//! A [`SecurityBlob`] is a read-only window over the connection's receive
//! buffer holding one client authentication token, together with the
//! response token the server produces for that round. The window borrows the
//! buffer, so a blob can never outlive the round it was built for: the
//! transport is free to reuse the buffer once the borrow ends.

use super::ntlm::NTLMSSP_SIGNATURE;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;

/// Security blob formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityBlobType {
    /// A raw NTLMSSP message
    Ntlmssp,
    /// Anything else; must be unwrapped as an SPNEGO token
    Spnego,
}

impl fmt::Display for SecurityBlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityBlobType::Ntlmssp => f.write_str("NTLMSSP"),
            SecurityBlobType::Spnego => f.write_str("SPNEGO"),
        }
    }
}

/// Check whether the bytes at `offset` start with the NTLMSSP signature.
///
/// A signature region that runs past the end of `buf` is a non-match.
pub fn check_for_ntlmssp(buf: &[u8], offset: usize) -> bool {
    offset
        .checked_add(NTLMSSP_SIGNATURE.len())
        .and_then(|end| buf.get(offset..end))
        .map_or(false, |sig| sig == NTLMSSP_SIGNATURE)
}

/// Classify the token starting at `offset`.
pub fn classify(buf: &[u8], offset: usize) -> SecurityBlobType {
    if check_for_ntlmssp(buf, offset) {
        SecurityBlobType::Ntlmssp
    } else {
        SecurityBlobType::Spnego
    }
}

/// One round's authentication token plus the server's reply
#[derive(Clone)]
pub struct SecurityBlob<'a> {
    blob_type: SecurityBlobType,
    buf: &'a [u8],
    offset: usize,
    length: usize,
    unicode: bool,
    response: Option<Bytes>,
}

impl<'a> SecurityBlob<'a> {
    /// Create a blob over `buf[offset..offset + length]`.
    ///
    /// Fails with [`Error::InvalidTokenWindow`] if the window does not fit.
    pub fn new(
        blob_type: SecurityBlobType,
        buf: &'a [u8],
        offset: usize,
        length: usize,
        unicode: bool,
    ) -> Result<Self> {
        match offset.checked_add(length) {
            Some(end) if end <= buf.len() => Ok(Self {
                blob_type,
                buf,
                offset,
                length,
                unicode,
                response: None,
            }),
            _ => Err(Error::InvalidTokenWindow {
                offset,
                length,
                buffer_len: buf.len(),
            }),
        }
    }

    /// Create a blob over a window, classifying it from its leading bytes.
    pub fn classified(buf: &'a [u8], offset: usize, length: usize, unicode: bool) -> Result<Self> {
        let blob_type = classify(&buf[..buf.len().min(offset.saturating_add(length))], offset);
        Self::new(blob_type, buf, offset, length, unicode)
    }

    /// Create a blob spanning the whole buffer
    pub fn from_slice(blob_type: SecurityBlobType, buf: &'a [u8], unicode: bool) -> Self {
        Self {
            blob_type,
            buf,
            offset: 0,
            length: buf.len(),
            unicode,
            response: None,
        }
    }

    /// Blob over a sub-window of this blob, relative to its start. Used by
    /// token decoders to hand out an inner token without copying it.
    pub fn sub_window(&self, offset: usize, length: usize) -> Result<SecurityBlob<'a>> {
        let window = self.as_bytes();
        let blob_type = classify(&window[..window.len().min(offset.saturating_add(length))], offset);
        if offset.checked_add(length).map_or(true, |end| end > window.len()) {
            return Err(Error::InvalidTokenWindow {
                offset,
                length,
                buffer_len: window.len(),
            });
        }
        Self::new(blob_type, self.buf, self.offset + offset, length, self.unicode)
    }

    pub fn blob_type(&self) -> SecurityBlobType {
        self.blob_type
    }

    pub fn is_ntlmssp(&self) -> bool {
        self.blob_type == SecurityBlobType::Ntlmssp
    }

    pub fn is_spnego(&self) -> bool {
        self.blob_type == SecurityBlobType::Spnego
    }

    pub fn is_unicode(&self) -> bool {
        self.unicode
    }

    /// The whole underlying buffer
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The token bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.buf[self.offset..self.offset + self.length]
    }

    pub fn has_response_blob(&self) -> bool {
        self.response.is_some()
    }

    pub fn response_blob(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    /// Length of the response blob, zero if none was produced
    pub fn response_len(&self) -> usize {
        self.response.as_ref().map_or(0, Bytes::len)
    }

    /// Attach the server's response token. A response can only be set once.
    pub fn set_response_blob(&mut self, response: impl Into<Bytes>) -> Result<()> {
        if self.response.is_some() {
            return Err(Error::ResponseAlreadySet);
        }
        self.response = Some(response.into());
        Ok(())
    }

    /// Finish the round, handing the response token to the transport writer.
    pub fn into_response_blob(self) -> Option<Bytes> {
        self.response
    }
}

impl fmt::Debug for SecurityBlob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityBlob")
            .field("blob_type", &self.blob_type)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("unicode", &self.unicode)
            .field("response_len", &self.response_len())
            .finish()
    }
}

impl fmt::Display for SecurityBlob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} secBlob=[offset={},len={}]",
            self.blob_type, self.offset, self.length
        )?;
        if self.unicode {
            f.write_str(" Unicode")?;
        }
        match &self.response {
            Some(resp) => write!(f, ", respBlob={}bytes]", resp.len()),
            None => f.write_str(", respBlob=null]"),
        }
    }
}
