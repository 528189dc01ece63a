//! CIFS connection handler
//!
//! Runs the SMB2 handshake for one connection: NEGOTIATE, then as many
//! SESSION_SETUP rounds as the authentication exchange needs. Filesystem
//! commands are refused; before authentication with ACCESS_DENIED and after
//! it with NOT_SUPPORTED.

use crate::auth::{ntlm_crypto, spnego, AuthVerdict};
use crate::error::{Error, NtStatus, Result};
use crate::netbios::NetBiosMessageType;
use crate::protocol::constants::{SecurityMode, SessionFlags, Smb2Command, Smb2Dialect};
use crate::protocol::messages::{
    Smb2EmptyMessage, Smb2ErrorResponse, Smb2NegotiateRequest, Smb2NegotiateResponse,
    Smb2SessionSetupRequest, Smb2SessionSetupResponse, SmbMessage,
};
use crate::protocol::{Smb2Header, SMB1_MAGIC, SMB2_HEADER_SIZE};
use crate::server::ServerContext;
use crate::session::{PeerAddress, ProtocolId, ServerSession, SessionId, SessionRegistry};
use crate::transport::{
    spawn_writer, write_frame, Frame, FrameReader, PacketHandle, DEFAULT_QUEUE_DEPTH,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace, warn};

/// Handles one accepted CIFS connection
pub struct ConnectionHandler {
    context: Arc<ServerContext>,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
}

impl ConnectionHandler {
    pub fn new(
        context: Arc<ServerContext>,
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
    ) -> Self {
        Self {
            context,
            registry,
            session_id,
        }
    }

    /// Handle the connection until the peer goes away.
    ///
    /// The session is created before any I/O. It is closed on every exit
    /// path, which drops a half-finished authentication exchange.
    pub async fn handle<S>(&self, stream: S, remote_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (packets, rx) = PacketHandle::channel(DEFAULT_QUEUE_DEPTH);
        let session = self.registry.create_session(
            packets,
            &self.context,
            self.session_id,
            ProtocolId::Cifs,
            PeerAddress::Inet(remote_addr),
        )?;

        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameReader::new(reader);

        let first = Self::session_request(&mut frames, &mut writer).await;
        let writer_task = spawn_writer(writer, rx);
        let result = match first {
            Ok(first) => self.process(&session, &mut frames, first).await,
            Err(e) => Err(e),
        };

        if session.close().await {
            debug!(
                "Dropped unfinished authentication exchange with {}",
                remote_addr
            );
        }
        // Last packet handle goes with the session, which stops the writer
        drop(session);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Writer for {} stopped: {}", remote_addr, e),
            Err(e) => error!("Writer task for {} failed: {}", remote_addr, e),
        }

        result
    }

    /// Answer a NetBIOS session request if the connection opens with one
    /// (port 139). Returns the first frame still to be processed.
    async fn session_request<R, W>(
        frames: &mut FrameReader<R>,
        writer: &mut W,
    ) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match frames.read_frame().await? {
            Some(frame) if frame.message_type == NetBiosMessageType::SessionRequest => {
                debug!("NetBIOS session request, sending positive response");
                write_frame(writer, NetBiosMessageType::PositiveResponse, &[]).await?;
                frames.read_frame().await
            }
            other => Ok(other),
        }
    }

    async fn process<R>(
        &self,
        session: &ServerSession,
        frames: &mut FrameReader<R>,
        first: Option<Frame>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut next = first;
        while let Some(frame) = next {
            match frame.message_type {
                NetBiosMessageType::SessionMessage => {
                    if !self.dispatch(session, &frame.payload).await? {
                        break;
                    }
                }
                NetBiosMessageType::Keepalive => trace!("NetBIOS keepalive"),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected NetBIOS message: {:?}",
                        other
                    )))
                }
            }
            next = frames.read_frame().await?;
        }
        Ok(())
    }

    /// Process one SMB message. Returns false once the connection should end.
    async fn dispatch(&self, session: &ServerSession, data: &[u8]) -> Result<bool> {
        if data.starts_with(&SMB1_MAGIC) {
            debug!("SMB1 negotiate, answering with SMB2");
            let request = Smb2Header::new(Smb2Command::Negotiate);
            let body = self.negotiate_response(Smb2Dialect::Smb202).serialize()?;
            self.reply(session, &request, NtStatus::Success, 0, body).await?;
            return Ok(true);
        }

        let header = Smb2Header::parse(data)?;
        if header.is_response() {
            return Err(Error::Protocol("Received an SMB2 response".to_string()));
        }
        let body = &data[SMB2_HEADER_SIZE..];
        debug!(
            "Session {} command {:?} message {}",
            session.id(),
            header.command,
            header.message_id
        );

        if !header.command.is_handshake()
            && header.command != Smb2Command::Logoff
            && !session.is_authenticated()
        {
            debug!("Refusing {:?} before authentication", header.command);
            self.reply_error(session, &header, NtStatus::AccessDenied).await?;
            return Ok(true);
        }

        match header.command {
            Smb2Command::Negotiate => self.handle_negotiate(session, &header, body).await?,
            Smb2Command::SessionSetup => self.handle_session_setup(session, &header, body).await?,
            Smb2Command::Echo => {
                let body = Smb2EmptyMessage.serialize()?;
                self.reply(session, &header, NtStatus::Success, header.session_id, body)
                    .await?;
            }
            // No response is sent for CANCEL
            Smb2Command::Cancel => {}
            Smb2Command::Logoff => {
                session.close().await;
                let body = Smb2EmptyMessage.serialize()?;
                self.reply(session, &header, NtStatus::Success, session.id().0, body)
                    .await?;
                return Ok(false);
            }
            command => {
                debug!("{:?} is not served on this connection", command);
                self.reply_error(session, &header, NtStatus::NotSupported)
                    .await?;
            }
        }
        Ok(true)
    }

    fn negotiate_response(&self, dialect: Smb2Dialect) -> Smb2NegotiateResponse {
        let mut response = Smb2NegotiateResponse::new(dialect, self.context.server_guid());
        if self.context.config().require_signing {
            response.security_mode |= SecurityMode::SIGNING_REQUIRED;
        }
        response.system_time = ntlm_crypto::to_windows_timestamp(Utc::now());
        response.server_start_time = ntlm_crypto::to_windows_timestamp(self.context.start_time());
        response.security_blob = spnego::build_neg_token_init();
        response
    }

    async fn handle_negotiate(
        &self,
        session: &ServerSession,
        header: &Smb2Header,
        body: &[u8],
    ) -> Result<()> {
        let request = match Smb2NegotiateRequest::parse(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed NEGOTIATE request: {}", e);
                return self.reply_error(session, header, NtStatus::InvalidParameter).await;
            }
        };

        match request.select_dialect() {
            Some(dialect) => {
                debug!("Negotiated dialect {:?}", dialect);
                let body = self.negotiate_response(dialect).serialize()?;
                self.reply(session, header, NtStatus::Success, 0, body).await
            }
            None => {
                warn!(
                    "No common dialect with {} (offered {:04x?})",
                    session.remote_addr(),
                    request.dialects
                );
                self.reply_error(session, header, NtStatus::NotSupported).await
            }
        }
    }

    async fn handle_session_setup(
        &self,
        session: &ServerSession,
        header: &Smb2Header,
        body: &[u8],
    ) -> Result<()> {
        let request = match Smb2SessionSetupRequest::parse(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed SESSION_SETUP request: {}", e);
                return self.reply_error(session, header, NtStatus::InvalidParameter).await;
            }
        };

        let mut token = request.security_blob(session.kind().is_unicode())?;
        let verdict = match session.advance_auth(&mut token).await {
            Ok(verdict) => verdict,
            Err(Error::SessionAlreadyResolved(state)) => {
                warn!(
                    "SESSION_SETUP on session {} which is already {}",
                    session.id(),
                    state
                );
                return self.reply_error(session, header, NtStatus::InvalidParameter).await;
            }
            Err(e) => return Err(e),
        };

        let mut flags = SessionFlags::empty();
        if verdict == AuthVerdict::Success {
            if let Some(principal) = session.principal().await {
                if principal.is_guest {
                    flags |= SessionFlags::IS_GUEST;
                }
            }
        }

        let security_blob = token
            .into_response_blob()
            .map(|blob| blob.to_vec())
            .unwrap_or_default();
        let body = Smb2SessionSetupResponse::new(flags, security_blob).serialize()?;
        self.reply(session, header, verdict.status(), session.id().0, body)
            .await
    }

    async fn reply_error(
        &self,
        session: &ServerSession,
        request: &Smb2Header,
        status: NtStatus,
    ) -> Result<()> {
        let body = Smb2ErrorResponse.serialize()?;
        self.reply(session, request, status, request.session_id, body)
            .await
    }

    /// Queue a response. Packets reach the wire in the order they are queued.
    async fn reply(
        &self,
        session: &ServerSession,
        request: &Smb2Header,
        status: NtStatus,
        session_id: u64,
        body: Vec<u8>,
    ) -> Result<()> {
        let header = Smb2Header::response_to(request, status, session_id);
        let mut packet = header.serialize()?;
        packet.extend_from_slice(&body);
        trace!(
            "Sending {:?} response with status {}, {} bytes",
            request.command,
            status,
            packet.len()
        );
        session.packet_handle().send(packet).await
    }
}
