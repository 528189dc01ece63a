//! Per-session authentication state machine
//!
//! ```text
//! Init ──Continue──▶ ChallengeSent ──Continue──┐
//!  │                    │     ▲                │
//!  │                    │     └────────────────┘
//!  ├──Accept──▶ Authenticated ◀──Accept──┤
//!  └──Reject──▶ Failed ◀─────Reject──────┘
//! ```
//!
//! The mechanism context only exists inside the `ChallengeSent` phase, so it
//! is dropped exactly once, on whichever transition leaves that phase.

use super::blob::SecurityBlob;
use super::{AuthOutcome, CredentialAuthority, MechContext, Principal, SpnegoDecoder};
use crate::error::{Error, NtStatus, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthState {
    Init = 0,
    ChallengeSent = 1,
    Authenticated = 2,
    Failed = 3,
}

impl AuthState {
    /// Authenticated and Failed are terminal
    pub fn is_resolved(self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Failed)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthState::Init),
            1 => Some(AuthState::ChallengeSent),
            2 => Some(AuthState::Authenticated),
            3 => Some(AuthState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Init => "INIT",
            AuthState::ChallengeSent => "CHALLENGE_SENT",
            AuthState::Authenticated => "AUTHENTICATED",
            AuthState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Result of one authentication round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Another round is needed; the token carries the response to send
    Continue,
    Success,
    Failure,
}

impl AuthVerdict {
    /// Status reported to the client for this verdict
    pub fn status(self) -> NtStatus {
        match self {
            AuthVerdict::Continue => NtStatus::MoreProcessingRequired,
            AuthVerdict::Success => NtStatus::Success,
            AuthVerdict::Failure => NtStatus::LogonFailure,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Init,
    ChallengeSent(MechContext),
    Authenticated(Principal),
    Failed,
}

/// Authentication exchange owned by one session
pub struct AuthSession {
    phase: Phase,
    authority: Arc<dyn CredentialAuthority>,
    spnego: Arc<dyn SpnegoDecoder>,
    rounds: u32,
}

impl AuthSession {
    pub fn new(authority: Arc<dyn CredentialAuthority>, spnego: Arc<dyn SpnegoDecoder>) -> Self {
        Self {
            phase: Phase::Init,
            authority,
            spnego,
            rounds: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        match self.phase {
            Phase::Init => AuthState::Init,
            Phase::ChallengeSent(_) => AuthState::ChallengeSent,
            Phase::Authenticated(_) => AuthState::Authenticated,
            Phase::Failed => AuthState::Failed,
        }
    }

    /// Whether a mechanism context is currently retained
    pub fn has_mech_context(&self) -> bool {
        matches!(self.phase, Phase::ChallengeSent(_))
    }

    /// The authenticated identity, once the exchange succeeded
    pub fn principal(&self) -> Option<&Principal> {
        match &self.phase {
            Phase::Authenticated(principal) => Some(principal),
            _ => None,
        }
    }

    /// Number of rounds processed so far
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Process one client token.
    ///
    /// Malformed or wrong credentials resolve to [`AuthVerdict::Failure`];
    /// only caller mistakes are returned as errors. On `Continue` the token's
    /// response blob holds the reply for the client.
    pub async fn advance(&mut self, token: &mut SecurityBlob<'_>) -> Result<AuthVerdict> {
        let state = self.state();
        if state.is_resolved() {
            return Err(Error::SessionAlreadyResolved(state));
        }
        if token.has_response_blob() {
            return Err(Error::ResponseAlreadySet);
        }
        self.rounds += 1;
        debug!("Auth round {} in state {}: {}", self.rounds, state, token);

        let wrapped = token.is_spnego();
        let mech_token = if wrapped {
            match self.spnego.unwrap(token) {
                Ok(inner) => inner,
                Err(e) => {
                    // Parser details stay in the log, the client just fails
                    warn!("Rejecting undecodable SPNEGO token: {}", e);
                    self.phase = Phase::Failed;
                    return Ok(AuthVerdict::Failure);
                }
            }
        } else {
            token.clone()
        };

        let context = match &self.phase {
            Phase::ChallengeSent(context) => Some(context),
            _ => None,
        };
        let outcome = self.authority.evaluate(context, &mech_token).await;

        match outcome {
            AuthOutcome::Accept(principal) => {
                if wrapped {
                    token.set_response_blob(self.spnego.wrap_accept())?;
                }
                info!(
                    "Authenticated {}\\{}{}",
                    principal.domain,
                    principal.username,
                    if principal.is_guest { " as guest" } else { "" }
                );
                self.phase = Phase::Authenticated(principal);
                Ok(AuthVerdict::Success)
            }
            AuthOutcome::Continue { context, response } => {
                let response = if wrapped {
                    self.spnego.wrap_continue(&response)
                } else {
                    response
                };
                token.set_response_blob(response)?;
                debug!("Challenge issued by {} mechanism", context.mechanism());
                self.phase = Phase::ChallengeSent(context);
                Ok(AuthVerdict::Continue)
            }
            AuthOutcome::Reject => {
                info!("Authentication rejected after {} round(s)", self.rounds);
                self.phase = Phase::Failed;
                Ok(AuthVerdict::Failure)
            }
        }
    }

    /// Drop any in-flight mechanism context, abandoning the exchange.
    ///
    /// Returns true if a context was released. Resolved sessions are left
    /// untouched, so calling this repeatedly is harmless.
    pub fn release(&mut self) -> bool {
        match self.phase {
            Phase::ChallengeSent(_) => {
                debug!("Releasing mechanism context of abandoned exchange");
                self.phase = Phase::Failed;
                true
            }
            Phase::Init => {
                self.phase = Phase::Failed;
                false
            }
            _ => false,
        }
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("phase", &self.phase)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}
