//! NTLM credential authority backed by a local user table

use super::blob::SecurityBlob;
use super::ntlm::{
    peek_message_type, NtlmAuthenticateMessage, NtlmChallengeMessage, NtlmFlags,
    NtlmMessageType, NtlmNegotiateMessage, TargetInfo,
};
use super::ntlm_crypto::{self, NT_PROOF_LEN};
use super::{AuthOutcome, CredentialAuthority, MechContext, Principal};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mechanism name recorded in contexts created by [`NtlmAuthority`]
pub const NTLM_MECHANISM: &str = "NTLMSSP";

/// LM and NTLMv1 responses are exactly this long
const NTLMV1_RESPONSE_LEN: usize = 24;

/// Source of server challenges
pub type ChallengeSource = Arc<dyn Fn() -> [u8; 8] + Send + Sync>;

/// A configured user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

impl UserCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// State retained between the CHALLENGE and AUTHENTICATE messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtlmChallengeContext {
    pub server_challenge: [u8; 8],
    pub flags: NtlmFlags,
}

/// Verifies NTLMv2 logons against a table of NT password hashes.
///
/// Other than the random server challenge, evaluation is a pure function of
/// the context and token.
pub struct NtlmAuthority {
    users: HashMap<String, [u8; 16]>,
    workgroup: String,
    server_name: String,
    allow_guest: bool,
    challenge_source: ChallengeSource,
}

impl NtlmAuthority {
    pub fn new(workgroup: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            users: HashMap::new(),
            workgroup: workgroup.into(),
            server_name: server_name.into(),
            allow_guest: false,
            challenge_source: Arc::new(ntlm_crypto::generate_challenge),
        }
    }

    /// Add a user account. User names are matched case-insensitively.
    pub fn add_user(&mut self, credential: &UserCredential) -> Result<()> {
        let hash = ntlm_crypto::ntlm_hash(&credential.password)?;
        self.users.insert(credential.username.to_lowercase(), hash);
        Ok(())
    }

    pub fn with_users<'a>(
        mut self,
        credentials: impl IntoIterator<Item = &'a UserCredential>,
    ) -> Result<Self> {
        for credential in credentials {
            self.add_user(credential)?;
        }
        Ok(self)
    }

    /// Map anonymous and unknown users to guest instead of rejecting them
    pub fn with_guest(mut self, allow_guest: bool) -> Self {
        self.allow_guest = allow_guest;
        self
    }

    pub fn with_challenge_source(mut self, source: ChallengeSource) -> Self {
        self.challenge_source = source;
        self
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn challenge(&self, token: &[u8]) -> Result<AuthOutcome> {
        let negotiate = NtlmNegotiateMessage::parse(token)?;
        debug!(
            "NTLM negotiate flags={:?} domain={:?} workstation={:?}",
            negotiate.flags, negotiate.domain_name, negotiate.workstation_name
        );

        let server_challenge = (self.challenge_source)();
        let target_info = TargetInfo::for_server(
            &self.workgroup,
            &self.server_name,
            ntlm_crypto::get_windows_timestamp(),
        )?;
        let mut message =
            NtlmChallengeMessage::new(self.workgroup.clone(), server_challenge, target_info);
        for optional in [
            NtlmFlags::NEGOTIATE_SIGN,
            NtlmFlags::NEGOTIATE_ALWAYS_SIGN,
            NtlmFlags::NEGOTIATE_128,
            NtlmFlags::NEGOTIATE_56,
        ] {
            if negotiate.flags.contains(optional) {
                message.flags |= optional;
            }
        }

        let response = message.serialize()?;
        Ok(AuthOutcome::Continue {
            context: MechContext::new(
                NTLM_MECHANISM,
                NtlmChallengeContext {
                    server_challenge,
                    flags: message.flags,
                },
            ),
            response,
        })
    }

    fn guest_or_reject(&self, reason: &str) -> AuthOutcome {
        if self.allow_guest {
            debug!("{}, logging on as guest", reason);
            AuthOutcome::Accept(Principal::guest())
        } else {
            debug!("{}, guest access disabled", reason);
            AuthOutcome::Reject
        }
    }

    fn authenticate(&self, context: &NtlmChallengeContext, token: &[u8]) -> Result<AuthOutcome> {
        let message = NtlmAuthenticateMessage::parse(token)?;

        if message.is_anonymous() {
            return Ok(self.guest_or_reject("Anonymous logon"));
        }
        if message.nt_response.len() <= NTLMV1_RESPONSE_LEN {
            warn!(
                "Rejecting NTLMv1 logon for user {:?}: only NTLMv2 is accepted",
                message.user_name
            );
            return Ok(AuthOutcome::Reject);
        }

        let nt_hash = match self.users.get(&message.user_name.to_lowercase()) {
            Some(hash) => hash,
            None => {
                return Ok(self.guest_or_reject(&format!("Unknown user {:?}", message.user_name)))
            }
        };

        let v2_hash = ntlm_crypto::ntlmv2_hash(nt_hash, &message.user_name, &message.domain_name)?;
        if ntlm_crypto::verify_ntlmv2_response(
            &v2_hash,
            &context.server_challenge,
            &message.nt_response,
        )? {
            Ok(AuthOutcome::Accept(Principal::user(
                message.user_name,
                message.domain_name,
            )))
        } else {
            debug!(
                "NTProofStr mismatch for {:?} ({} byte response, proof {} bytes)",
                message.user_name,
                message.nt_response.len(),
                NT_PROOF_LEN
            );
            Ok(AuthOutcome::Reject)
        }
    }
}

#[async_trait]
impl CredentialAuthority for NtlmAuthority {
    async fn evaluate(
        &self,
        context: Option<&MechContext>,
        token: &SecurityBlob<'_>,
    ) -> AuthOutcome {
        let data = token.as_bytes();
        let result = match (context, peek_message_type(data)) {
            (None, Ok(NtlmMessageType::Negotiate)) => self.challenge(data),
            (Some(context), Ok(NtlmMessageType::Authenticate)) => {
                match context.downcast_ref::<NtlmChallengeContext>() {
                    Some(challenge) => self.authenticate(challenge, data),
                    None => {
                        warn!("Foreign {} context handed to NTLM", context.mechanism());
                        return AuthOutcome::Reject;
                    }
                }
            }
            (context, Ok(message_type)) => {
                debug!(
                    "Unexpected NTLM {:?} message (context held: {})",
                    message_type,
                    context.is_some()
                );
                return AuthOutcome::Reject;
            }
            (_, Err(e)) => Err(e),
        };

        result.unwrap_or_else(|e| {
            debug!("Rejecting malformed NTLM token: {}", e);
            AuthOutcome::Reject
        })
    }
}

impl fmt::Debug for NtlmAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmAuthority")
            .field("workgroup", &self.workgroup)
            .field("server_name", &self.server_name)
            .field("allow_guest", &self.allow_guest)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}
