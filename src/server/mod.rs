//! File server front end

pub mod connection;

use crate::auth::{
    CredentialAuthority, DerSpnegoDecoder, NtlmAuthority, SpnegoDecoder, UserCredential,
};
use crate::error::{Error, Result};
use crate::session::{SessionId, SessionRegistry};
use chrono::{DateTime, Utc};
use connection::ConnectionHandler;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use uuid::Uuid;

/// File server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name
    pub server_name: String,
    /// Workgroup/domain name
    pub workgroup: String,
    /// Map anonymous and unknown users to guest
    pub allow_guest: bool,
    /// Require signing
    pub require_signing: bool,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Local user accounts
    pub users: Vec<UserCredential>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "RUST-FILESERVER".to_string(),
            workgroup: "WORKGROUP".to_string(),
            allow_guest: false,
            require_signing: false,
            max_connections: 100,
            users: Vec::new(),
        }
    }
}

/// Process-wide state shared by every session
pub struct ServerContext {
    config: ServerConfig,
    authority: Arc<dyn CredentialAuthority>,
    spnego: Arc<dyn SpnegoDecoder>,
    server_guid: Uuid,
    start_time: DateTime<Utc>,
}

impl ServerContext {
    /// Context authenticating against the configured local users
    pub fn new(config: ServerConfig) -> Result<Self> {
        let authority = NtlmAuthority::new(config.workgroup.clone(), config.server_name.clone())
            .with_users(&config.users)?
            .with_guest(config.allow_guest);
        Ok(Self::with_authority(config, Arc::new(authority)))
    }

    pub fn with_authority(config: ServerConfig, authority: Arc<dyn CredentialAuthority>) -> Self {
        Self {
            config,
            authority,
            spnego: Arc::new(DerSpnegoDecoder),
            server_guid: Uuid::new_v4(),
            start_time: Utc::now(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<dyn CredentialAuthority> {
        &self.authority
    }

    pub fn spnego(&self) -> &Arc<dyn SpnegoDecoder> {
        &self.spnego
    }

    pub fn server_guid(&self) -> Uuid {
        self.server_guid
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("server_name", &self.config.server_name)
            .field("workgroup", &self.config.workgroup)
            .field("server_guid", &self.server_guid)
            .finish_non_exhaustive()
    }
}

/// CIFS file server accepting connections over TCP
pub struct FileServer {
    context: Arc<ServerContext>,
    registry: Arc<SessionRegistry>,
    connections: Arc<Semaphore>,
    next_session_id: AtomicU64,
}

impl FileServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let context = ServerContext::new(config)?;
        Ok(Self::with_context(context, SessionRegistry::with_defaults()))
    }

    pub fn with_context(context: ServerContext, registry: SessionRegistry) -> Self {
        let max_connections = context.config.max_connections.max(1);
        Self {
            context: Arc::new(context),
            registry: Arc::new(registry),
            connections: Arc::new(Semaphore::new(max_connections)),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Run the server on the specified address
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("File server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until it fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Server name: {}", self.context.config.server_name);
        info!("Workgroup: {}", self.context.config.workgroup);

        loop {
            let permit = self
                .connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            let (stream, remote_addr) = listener.accept().await?;
            let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
            info!("New connection from {} (session {})", remote_addr, session_id);

            let handler = ConnectionHandler::new(
                Arc::clone(&self.context),
                Arc::clone(&self.registry),
                session_id,
            );

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.handle(stream, remote_addr).await {
                    error!("Connection error from {}: {}", remote_addr, e);
                }
                debug!("Connection from {} closed", remote_addr);
            });
        }
    }
}

impl fmt::Debug for FileServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileServer")
            .field("context", &self.context)
            .field("registry", &self.registry)
            .field("available_connections", &self.connections.available_permits())
            .finish()
    }
}
