//! Server sessions
//!
//! A [`ServerSession`] is created by a [`factory::SessionFactory`] for every
//! accepted association and lives until the transport closes it. It owns the
//! session's [`AuthSession`] and serializes authentication rounds through an
//! async mutex, so rounds queued by one connection are processed one at a
//! time and in arrival order.

pub mod factory;

pub use factory::{
    CifsSessionFactory, NfsSessionFactory, SessionFactory, SessionRegistry,
    SessionRegistryBuilder,
};

use crate::auth::{AuthSession, AuthState, AuthVerdict, Principal, SecurityBlob};
use crate::error::{Error, Result};
use crate::storage::{AuthorizedStore, FileDataStore};
use crate::transport::PacketHandle;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Server-wide unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Wire protocol and transport a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    NfsTcp,
    NfsUdp,
    Cifs,
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolId::NfsTcp => "NFS/TCP",
            ProtocolId::NfsUdp => "NFS/UDP",
            ProtocolId::Cifs => "CIFS",
        };
        f.write_str(name)
    }
}

/// Remote endpoint reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// Host and port
    Inet(SocketAddr),
    /// Local socket, possibly unnamed
    Unix(Option<PathBuf>),
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::Inet(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Inet(addr) => write!(f, "{}", addr),
            PeerAddress::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddress::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

/// RPC transport of an NFS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTransport {
    Tcp,
    Udp,
}

/// Protocol specific session metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Nfs { transport: RpcTransport },
    Cifs { unicode: bool },
}

impl SessionKind {
    /// Whether strings in this session's security tokens are UTF-16
    pub fn is_unicode(&self) -> bool {
        match self {
            SessionKind::Nfs { .. } => false,
            SessionKind::Cifs { unicode } => *unicode,
        }
    }
}

/// One client association and its authentication exchange
pub struct ServerSession {
    id: SessionId,
    protocol: ProtocolId,
    remote_addr: SocketAddr,
    packet_handle: PacketHandle,
    kind: SessionKind,
    created: DateTime<Utc>,
    auth: Mutex<AuthSession>,
    /// Mirror of the auth state, readable without waiting for a round
    state: AtomicU8,
    closed: AtomicBool,
}

impl ServerSession {
    /// Build a session in the `INIT` authentication state
    pub fn new(
        id: SessionId,
        protocol: ProtocolId,
        remote_addr: SocketAddr,
        packet_handle: PacketHandle,
        kind: SessionKind,
        auth: AuthSession,
    ) -> Self {
        let state = auth.state();
        Self {
            id,
            protocol,
            remote_addr,
            packet_handle,
            kind,
            created: Utc::now(),
            auth: Mutex::new(auth),
            state: AtomicU8::new(state as u8),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn packet_handle(&self) -> &PacketHandle {
        &self.packet_handle
    }

    /// Run one authentication round.
    ///
    /// Concurrent callers wait their turn; each round sees the mechanism
    /// context left by the previous one.
    pub async fn advance_auth(&self, token: &mut SecurityBlob<'_>) -> Result<AuthVerdict> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut auth = self.auth.lock().await;
        // Closed while this round was queued
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let verdict = auth.advance(token).await;
        self.state.store(auth.state() as u8, Ordering::Release);
        if let Ok(verdict) = &verdict {
            debug!(
                "Session {} ({}) round {}: {:?}, now {}",
                self.id,
                self.protocol,
                auth.rounds(),
                verdict,
                auth.state()
            );
        }
        verdict
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(AuthState::Failed)
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    /// The authenticated identity, if any
    pub async fn principal(&self) -> Option<Principal> {
        self.auth.lock().await.principal().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session, releasing any in-flight mechanism context.
    ///
    /// Waits for a round in progress to finish. Only the first call has an
    /// effect; it returns true if a mechanism context was dropped.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut auth = self.auth.lock().await;
        let released = auth.release();
        self.state.store(auth.state() as u8, Ordering::Release);
        info!(
            "Session {} ({}) from {} closed in state {}",
            self.id,
            self.protocol,
            self.remote_addr,
            auth.state()
        );
        released
    }

    /// Queue a packet on this session's connection
    pub async fn send(&self, packet: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.packet_handle.send(packet).await
    }

    /// Access a file data store on behalf of this session.
    ///
    /// Only authenticated, open sessions are granted access.
    pub async fn data_store<'s, S>(&self, store: &'s S) -> Result<AuthorizedStore<'s, S>>
    where
        S: FileDataStore + ?Sized,
    {
        if self.is_closed() || !self.is_authenticated() {
            return Err(Error::AccessDenied(format!(
                "session {} is not authenticated",
                self.id
            )));
        }
        let principal = self.principal().await.ok_or_else(|| {
            Error::AccessDenied(format!("session {} has no principal", self.id))
        })?;
        Ok(AuthorizedStore::new(store, principal))
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr)
            .field("kind", &self.kind)
            .field("state", &self.auth_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        AuthOutcome, CredentialAuthority, DerSpnegoDecoder, MechContext, SecurityBlobType,
    };
    use crate::storage::{FileDataKey, MemoryDataStore};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Two-leg authority: byte 1 challenges, byte 3 is accepted only after a
    /// challenge, anything else is rejected. Records round entry and exit.
    #[derive(Default)]
    struct TwoLegAuthority {
        events: std::sync::Mutex<Vec<&'static str>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CredentialAuthority for TwoLegAuthority {
        async fn evaluate(
            &self,
            context: Option<&MechContext>,
            token: &SecurityBlob<'_>,
        ) -> AuthOutcome {
            self.events.lock().unwrap().push("enter");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = match (context.is_some(), token.as_bytes().first()) {
                (_, Some(1)) => AuthOutcome::Continue {
                    context: MechContext::new("two-leg", ()),
                    response: vec![2],
                },
                (true, Some(3)) => AuthOutcome::Accept(Principal::user("bob", "LAB")),
                _ => AuthOutcome::Reject,
            };
            self.events.lock().unwrap().push("exit");
            outcome
        }
    }

    fn session_with(
        authority: Arc<TwoLegAuthority>,
    ) -> (ServerSession, tokio::sync::mpsc::Receiver<Bytes>) {
        let (handle, rx) = PacketHandle::channel(4);
        let auth = AuthSession::new(authority, Arc::new(DerSpnegoDecoder));
        let session = ServerSession::new(
            SessionId(1),
            ProtocolId::Cifs,
            "127.0.0.1:50000".parse().unwrap(),
            handle,
            SessionKind::Cifs { unicode: true },
            auth,
        );
        (session, rx)
    }

    fn token(buf: &[u8]) -> SecurityBlob<'_> {
        SecurityBlob::from_slice(SecurityBlobType::Ntlmssp, buf, true)
    }

    #[tokio::test]
    async fn test_new_session_is_unauthenticated() {
        let (session, _rx) = session_with(Arc::default());
        assert_eq!(session.auth_state(), AuthState::Init);
        assert!(!session.is_authenticated());
        assert!(!session.is_closed());
        assert!(session.principal().await.is_none());
    }

    #[tokio::test]
    async fn test_two_leg_exchange() {
        let (session, _rx) = session_with(Arc::default());

        let mut first = token(&[1]);
        assert_eq!(session.advance_auth(&mut first).await.unwrap(), AuthVerdict::Continue);
        assert_eq!(first.response_blob(), Some(&[2u8][..]));
        assert_eq!(session.auth_state(), AuthState::ChallengeSent);

        let mut second = token(&[3]);
        assert_eq!(session.advance_auth(&mut second).await.unwrap(), AuthVerdict::Success);
        assert!(session.is_authenticated());
        assert_eq!(session.principal().await.unwrap().username, "bob");

        // Terminal states refuse further rounds
        assert!(matches!(
            session.advance_auth(&mut token(&[1])).await,
            Err(Error::SessionAlreadyResolved(AuthState::Authenticated))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _rx) = session_with(Arc::default());
        session.advance_auth(&mut token(&[1])).await.unwrap();

        assert!(session.close().await);
        assert_eq!(session.auth_state(), AuthState::Failed);
        assert!(!session.close().await);
        assert!(session.is_closed());

        assert!(matches!(
            session.advance_auth(&mut token(&[3])).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_after_success_keeps_state() {
        let (session, _rx) = session_with(Arc::default());
        session.advance_auth(&mut token(&[1])).await.unwrap();
        session.advance_auth(&mut token(&[3])).await.unwrap();

        assert!(!session.close().await);
        assert_eq!(session.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_rounds_are_serialized() {
        let authority = Arc::new(TwoLegAuthority {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let (session, _rx) = session_with(authority.clone());
        let session = Arc::new(session);

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.advance_auth(&mut token(&[1])).await })
        };
        let b = {
            let session = session.clone();
            tokio::spawn(async move { session.advance_auth(&mut token(&[1])).await })
        };
        assert_eq!(a.await.unwrap().unwrap(), AuthVerdict::Continue);
        assert_eq!(b.await.unwrap().unwrap(), AuthVerdict::Continue);

        let events = authority.events.lock().unwrap().clone();
        assert_eq!(events, vec!["enter", "exit", "enter", "exit"]);
    }

    #[tokio::test]
    async fn test_send_goes_through_packet_handle() {
        let (session, mut rx) = session_with(Arc::default());
        session.send(vec![1u8, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[1, 2, 3]);

        session.close().await;
        assert!(matches!(session.send(vec![4u8]).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_data_store_requires_authentication() {
        let store = MemoryDataStore::new();
        let (session, _rx) = session_with(Arc::default());
        assert!(matches!(
            session.data_store(&store).await,
            Err(Error::AccessDenied(_))
        ));

        session.advance_auth(&mut token(&[1])).await.unwrap();
        session.advance_auth(&mut token(&[3])).await.unwrap();

        let access = session.data_store(&store).await.unwrap();
        assert_eq!(access.principal().username, "bob");
        access
            .save_file_data(FileDataKey::main(1), Bytes::from_static(b"data"))
            .await
            .unwrap();

        session.close().await;
        assert!(session.data_store(&store).await.is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolId::NfsUdp.to_string(), "NFS/UDP");
        assert_eq!(SessionId(255).to_string(), "0xff");
        assert_eq!(PeerAddress::Unix(None).to_string(), "unix:(unnamed)");
        let addr: SocketAddr = "10.0.0.1:2049".parse().unwrap();
        assert_eq!(PeerAddress::from(addr).to_string(), "10.0.0.1:2049");
        assert!(SessionKind::Cifs { unicode: true }.is_unicode());
        assert!(!SessionKind::Nfs { transport: RpcTransport::Udp }.is_unicode());
    }
}
