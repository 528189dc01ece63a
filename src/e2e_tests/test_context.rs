//! Test context for end-to-end handshake tests
//!
//! Runs a [`ConnectionHandler`] on one end of a loopback connection and
//! gives the test a minimal SMB2 client on the other.

use super::loopback::LoopbackTransport;
use crate::auth::ntlm::{NtlmAuthenticateMessage, NtlmChallengeMessage, NtlmNegotiateMessage};
use crate::auth::{
    AuthOutcome, CredentialAuthority, DerSpnegoDecoder, MechContext, NtlmAuthority,
    SecurityBlob, SpnegoDecoder, UserCredential,
};
use crate::error::{Error, Result};
use crate::netbios::NetBiosMessageType;
use crate::protocol::constants::Smb2Command;
use crate::protocol::messages::{Smb2NegotiateRequest, Smb2SessionSetupRequest, SmbMessage};
use crate::protocol::{Smb2Dialect, Smb2Header, SMB2_HEADER_SIZE};
use crate::server::connection::ConnectionHandler;
use crate::server::{ServerConfig, ServerContext};
use crate::session::{SessionId, SessionRegistry};
use crate::transport::{write_frame, Frame, FrameReader};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";
pub const DOMAIN: &str = "WORKGROUP";

/// Decrements the live context count when the context holding it is dropped
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tracked {
    inner: MechContext,
    _live: LiveGuard,
}

/// Wraps an [`NtlmAuthority`] and counts the mechanism contexts it has
/// handed out that are still alive.
pub struct TrackingAuthority {
    inner: NtlmAuthority,
    live: Arc<AtomicUsize>,
}

impl TrackingAuthority {
    pub fn new(inner: NtlmAuthority) -> Self {
        Self {
            inner,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live_contexts(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }
}

#[async_trait]
impl CredentialAuthority for TrackingAuthority {
    async fn evaluate(
        &self,
        context: Option<&MechContext>,
        token: &SecurityBlob<'_>,
    ) -> AuthOutcome {
        let inner = context
            .and_then(|c| c.downcast_ref::<Tracked>())
            .map(|tracked| &tracked.inner);
        match self.inner.evaluate(inner, token).await {
            AuthOutcome::Continue { context, response } => {
                self.live.fetch_add(1, Ordering::SeqCst);
                let mechanism = context.mechanism();
                let tracked = Tracked {
                    inner: context,
                    _live: LiveGuard(self.live.clone()),
                };
                AuthOutcome::Continue {
                    context: MechContext::new(mechanism, tracked),
                    response,
                }
            }
            other => other,
        }
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        users: vec![UserCredential::new(USER, PASSWORD)],
        ..Default::default()
    }
}

/// Connected client with a server task behind it
pub struct TestContext {
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
    pub server_task: JoinHandle<Result<()>>,
    live: Arc<AtomicUsize>,
    pub session_id: u64,
    next_message_id: u64,
}

impl TestContext {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ServerConfig) -> Result<Self> {
        let authority = NtlmAuthority::new(config.workgroup.clone(), config.server_name.clone())
            .with_users(&config.users)?
            .with_guest(config.allow_guest);
        let authority = TrackingAuthority::new(authority);
        let live = authority.live_contexts();
        let context = ServerContext::with_authority(config, Arc::new(authority));

        let (client_stream, server_stream) = LoopbackTransport::new().await?;
        let peer = server_stream.peer_addr()?;
        let handler = ConnectionHandler::new(
            Arc::new(context),
            Arc::new(SessionRegistry::with_defaults()),
            SessionId(0x1001),
        );
        let server_task = tokio::spawn(async move { handler.handle(server_stream, peer).await });

        let (reader, writer) = tokio::io::split(client_stream);
        Ok(Self {
            reader: FrameReader::new(reader),
            writer,
            server_task,
            live,
            session_id: 0,
            next_message_id: 0,
        })
    }

    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Live context count that outlives this context
    pub fn live_counter(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }

    pub async fn send_frame(
        &mut self,
        message_type: NetBiosMessageType,
        payload: &[u8],
    ) -> Result<()> {
        write_frame(&mut self.writer, message_type, payload).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        self.reader.read_frame().await
    }

    /// Send one SMB2 request and wait for its response
    pub async fn request(
        &mut self,
        command: Smb2Command,
        body: &[u8],
    ) -> Result<(Smb2Header, Bytes)> {
        let mut header = Smb2Header::new(command);
        header.message_id = self.next_message_id;
        header.session_id = self.session_id;
        self.next_message_id += 1;

        let mut packet = header.serialize()?;
        packet.extend_from_slice(body);
        self.send_frame(NetBiosMessageType::SessionMessage, &packet).await?;

        let frame = self.recv_frame().await?.ok_or(Error::ConnectionClosed)?;
        let response = Smb2Header::parse(&frame.payload)?;
        assert!(response.is_response());
        assert_eq!(response.message_id, header.message_id);
        Ok((response, frame.payload.slice(SMB2_HEADER_SIZE..)))
    }

    pub async fn negotiate(&mut self) -> Result<(Smb2Header, Bytes)> {
        let request = Smb2NegotiateRequest::new(&[Smb2Dialect::Smb202, Smb2Dialect::Smb210]);
        self.request(Smb2Command::Negotiate, &request.serialize()?).await
    }

    /// One SESSION_SETUP round. Adopts the session id the server assigns.
    pub async fn session_setup(&mut self, token: &[u8]) -> Result<(Smb2Header, Bytes)> {
        let body = Smb2SessionSetupRequest::encode(token, 0)?;
        let (header, body) = self.request(Smb2Command::SessionSetup, &body).await?;
        if header.session_id != 0 {
            self.session_id = header.session_id;
        }
        Ok((header, body))
    }

    /// Drop the client end and wait for the server to finish
    pub async fn disconnect(self) -> Result<()> {
        let Self {
            reader,
            writer,
            server_task,
            ..
        } = self;
        drop(reader);
        drop(writer);
        server_task
            .await
            .map_err(|e| Error::Protocol(format!("Server task failed: {}", e)))?
    }
}

pub fn ntlm_negotiate() -> Vec<u8> {
    NtlmNegotiateMessage::new(DOMAIN.to_string(), "CLIENT".to_string())
        .serialize()
        .unwrap()
}

/// Answer the NTLM challenge carried by `challenge`
pub fn ntlm_authenticate(challenge: &[u8], user: &str, password: &str) -> Vec<u8> {
    let challenge = NtlmChallengeMessage::parse(challenge).unwrap();
    NtlmAuthenticateMessage::respond(&challenge, user, DOMAIN, password, *b"cli-chal")
        .unwrap()
        .serialize()
        .unwrap()
}

/// The mechanism token inside a SPNEGO token
pub fn spnego_inner(token: &[u8]) -> Vec<u8> {
    let blob = SecurityBlob::classified(token, 0, token.len(), true).unwrap();
    DerSpnegoDecoder.unwrap(&blob).unwrap().as_bytes().to_vec()
}
