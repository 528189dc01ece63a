//! Authentication for file server sessions
//!
//! The pieces fit together as follows: the transport cuts a [`SecurityBlob`]
//! out of an inbound request, the session's [`AuthSession`] classifies it,
//! unwraps SPNEGO through a [`SpnegoDecoder`] when needed, and hands the
//! mechanism token to a [`CredentialAuthority`] which decides whether to
//! accept, challenge again, or reject.

pub mod authority;
pub mod blob;
pub mod ntlm;
pub mod ntlm_crypto;
pub mod session;
pub mod spnego;

pub use authority::{NtlmAuthority, UserCredential};
pub use blob::{check_for_ntlmssp, classify, SecurityBlob, SecurityBlobType};
pub use session::{AuthSession, AuthState, AuthVerdict};
pub use spnego::DerSpnegoDecoder;

use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;

/// In-progress negotiation state retained by a credential authority between
/// a challenge and its response. Opaque to everything but the authority that
/// created it.
pub struct MechContext {
    mechanism: &'static str,
    inner: Box<dyn Any + Send + Sync>,
}

impl MechContext {
    pub fn new<T: Any + Send + Sync>(mechanism: &'static str, value: T) -> Self {
        Self {
            mechanism,
            inner: Box::new(value),
        }
    }

    /// Name of the mechanism that owns this context
    pub fn mechanism(&self) -> &'static str {
        self.mechanism
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for MechContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechContext")
            .field("mechanism", &self.mechanism)
            .finish_non_exhaustive()
    }
}

/// The identity an authenticated session runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub domain: String,
    pub is_guest: bool,
}

impl Principal {
    pub fn user(username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            is_guest: false,
        }
    }

    pub fn guest() -> Self {
        Self {
            username: "guest".to_string(),
            domain: String::new(),
            is_guest: true,
        }
    }
}

/// Result of evaluating one mechanism token
#[derive(Debug)]
pub enum AuthOutcome {
    /// The client is authenticated; no further round is needed
    Accept(Principal),
    /// Send `response` to the client and keep `context` for the next round
    Continue {
        context: MechContext,
        response: Vec<u8>,
    },
    /// The token was malformed or the credentials were wrong
    Reject,
}

/// Verifies client credentials one token at a time.
///
/// `evaluate` may consult local or networked credential stores and is awaited
/// on the calling session's task. It must not retain `token` past the call.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    async fn evaluate(&self, context: Option<&MechContext>, token: &SecurityBlob<'_>)
        -> AuthOutcome;
}

/// Unwraps SPNEGO envelopes and wraps server replies in them.
pub trait SpnegoDecoder: Send + Sync {
    /// Extract the mechanism token carried by a SPNEGO token. The result is
    /// a window over the same buffer as `token`.
    fn unwrap<'a>(&self, token: &SecurityBlob<'a>) -> Result<SecurityBlob<'a>>;

    /// Wrap a mechanism reply for a round that needs another leg
    fn wrap_continue(&self, response: &[u8]) -> Vec<u8>;

    /// Reply for a completed negotiation
    fn wrap_accept(&self) -> Vec<u8>;
}
