//! Session factories
//!
//! Each protocol family supplies a [`SessionFactory`]. The server looks the
//! factory up by [`ProtocolId`] in a [`SessionRegistry`] built at startup, so
//! adding a transport means registering one more factory.

use super::{PeerAddress, ProtocolId, RpcTransport, ServerSession, SessionId, SessionKind};
use crate::auth::AuthSession;
use crate::error::{Error, Result};
use crate::server::ServerContext;
use crate::transport::PacketHandle;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds protocol specific sessions for accepted associations
pub trait SessionFactory: Send + Sync {
    /// Create a session in the `INIT` authentication state.
    ///
    /// Fails with [`Error::UnsupportedAddress`] when `remote_addr` is not a
    /// host and port endpoint. Nothing is constructed in that case.
    fn create_session(
        &self,
        packet_handle: PacketHandle,
        server: &ServerContext,
        session_id: SessionId,
        protocol: ProtocolId,
        remote_addr: PeerAddress,
    ) -> Result<ServerSession>;
}

/// Check that `address` is a usable host and port endpoint
fn inet_endpoint(protocol: ProtocolId, address: PeerAddress) -> Result<SocketAddr> {
    match address {
        PeerAddress::Inet(addr) if !addr.ip().is_unspecified() && addr.port() != 0 => Ok(addr),
        address => {
            warn!(
                "Refusing {} session for non host/port address {}",
                protocol, address
            );
            Err(Error::UnsupportedAddress { protocol, address })
        }
    }
}

fn new_session(
    server: &ServerContext,
    packet_handle: PacketHandle,
    session_id: SessionId,
    protocol: ProtocolId,
    remote_addr: SocketAddr,
    kind: SessionKind,
) -> ServerSession {
    debug!(
        "Creating {} session {} for {}",
        protocol, session_id, remote_addr
    );
    let auth = AuthSession::new(server.authority().clone(), server.spnego().clone());
    ServerSession::new(session_id, protocol, remote_addr, packet_handle, kind, auth)
}

/// Factory for NFS sessions over ONC/RPC, TCP or UDP
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsSessionFactory;

impl SessionFactory for NfsSessionFactory {
    fn create_session(
        &self,
        packet_handle: PacketHandle,
        server: &ServerContext,
        session_id: SessionId,
        protocol: ProtocolId,
        remote_addr: PeerAddress,
    ) -> Result<ServerSession> {
        let transport = match protocol {
            ProtocolId::NfsTcp => RpcTransport::Tcp,
            ProtocolId::NfsUdp => RpcTransport::Udp,
            other => return Err(Error::UnsupportedProtocol(other)),
        };
        let remote_addr = inet_endpoint(protocol, remote_addr)?;
        Ok(new_session(
            server,
            packet_handle,
            session_id,
            protocol,
            remote_addr,
            SessionKind::Nfs { transport },
        ))
    }
}

/// Factory for CIFS sessions
#[derive(Debug, Clone, Copy)]
pub struct CifsSessionFactory {
    unicode: bool,
}

impl CifsSessionFactory {
    pub fn new(unicode: bool) -> Self {
        Self { unicode }
    }
}

impl Default for CifsSessionFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SessionFactory for CifsSessionFactory {
    fn create_session(
        &self,
        packet_handle: PacketHandle,
        server: &ServerContext,
        session_id: SessionId,
        protocol: ProtocolId,
        remote_addr: PeerAddress,
    ) -> Result<ServerSession> {
        if protocol != ProtocolId::Cifs {
            return Err(Error::UnsupportedProtocol(protocol));
        }
        let remote_addr = inet_endpoint(protocol, remote_addr)?;
        Ok(new_session(
            server,
            packet_handle,
            session_id,
            protocol,
            remote_addr,
            SessionKind::Cifs {
                unicode: self.unicode,
            },
        ))
    }
}

/// Protocol to factory mapping, read-only once built
#[derive(Clone)]
pub struct SessionRegistry {
    factories: HashMap<ProtocolId, Arc<dyn SessionFactory>>,
}

impl SessionRegistry {
    pub fn builder() -> SessionRegistryBuilder {
        SessionRegistryBuilder::default()
    }

    /// NFS over TCP and UDP plus unicode CIFS
    pub fn with_defaults() -> Self {
        let nfs: Arc<dyn SessionFactory> = Arc::new(NfsSessionFactory);
        Self::builder()
            .register(ProtocolId::NfsTcp, nfs.clone())
            .register(ProtocolId::NfsUdp, nfs)
            .register(ProtocolId::Cifs, Arc::new(CifsSessionFactory::default()))
            .build()
    }

    pub fn factory(&self, protocol: ProtocolId) -> Option<&Arc<dyn SessionFactory>> {
        self.factories.get(&protocol)
    }

    pub fn supports(&self, protocol: ProtocolId) -> bool {
        self.factories.contains_key(&protocol)
    }

    /// Dispatch to the factory registered for `protocol`
    pub fn create_session(
        &self,
        packet_handle: PacketHandle,
        server: &ServerContext,
        session_id: SessionId,
        protocol: ProtocolId,
        remote_addr: PeerAddress,
    ) -> Result<ServerSession> {
        let factory = self
            .factory(protocol)
            .ok_or(Error::UnsupportedProtocol(protocol))?;
        factory.create_session(packet_handle, server, session_id, protocol, remote_addr)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("protocols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct SessionRegistryBuilder {
    factories: HashMap<ProtocolId, Arc<dyn SessionFactory>>,
}

impl SessionRegistryBuilder {
    /// Register `factory` for `protocol`, replacing any earlier registration
    pub fn register(mut self, protocol: ProtocolId, factory: Arc<dyn SessionFactory>) -> Self {
        self.factories.insert(protocol, factory);
        self
    }

    pub fn build(self) -> SessionRegistry {
        SessionRegistry {
            factories: self.factories,
        }
    }
}
