//! NetBIOS framed stream transport

use crate::error::{Error, Result};
use crate::netbios::{NetBiosHeader, NetBiosMessageType};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One inbound NetBIOS message
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: NetBiosMessageType,
    pub payload: Bytes,
}

/// Reads NetBIOS frames from a byte stream
pub struct FrameReader<R> {
    reader: R,
    read_buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            read_buffer: BytesMut::with_capacity(65536),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames and
    /// [`Error::ConnectionClosed`] when it closes mid-frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.fill(NetBiosHeader::SIZE).await? {
            return Ok(None);
        }
        let header = NetBiosHeader::parse(&self.read_buffer)?;
        let total_size = NetBiosHeader::SIZE + header.length as usize;

        if !self.fill(total_size).await? {
            return Err(Error::ConnectionClosed);
        }

        let mut message = self.read_buffer.split_to(total_size);
        let payload = message.split_off(NetBiosHeader::SIZE).freeze();
        trace!(
            "Read {:?} frame of {} bytes",
            header.message_type,
            payload.len()
        );

        Ok(Some(Frame {
            message_type: header.message_type,
            payload,
        }))
    }

    /// Buffer at least `size` bytes. Returns false on a clean end of stream.
    async fn fill(&mut self, size: usize) -> Result<bool> {
        while self.read_buffer.len() < size {
            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(false);
                }
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(true)
    }
}

/// Write one NetBIOS framed message
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: NetBiosMessageType,
    payload: &[u8],
) -> Result<()> {
    let header = NetBiosHeader::new(message_type, payload.len() as u32)?;
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain `rx` into `writer` as session messages until every sender is gone.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            write_frame(&mut writer, NetBiosMessageType::SessionMessage, &packet).await?;
        }
        debug!("Packet channel closed, shutting down writer");
        writer.shutdown().await?;
        Ok(())
    })
}
