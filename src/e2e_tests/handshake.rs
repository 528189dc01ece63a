//! End-to-end handshake scenarios over a loopback TCP connection

use super::test_context::{
    ntlm_authenticate, ntlm_negotiate, spnego_inner, test_config, TestContext, PASSWORD, USER,
};
use crate::auth::ntlm::NtlmChallengeMessage;
use crate::auth::spnego::{encode_neg_token_init, encode_neg_token_resp};
use crate::error::NtStatus;
use crate::netbios::NetBiosMessageType;
use crate::protocol::constants::{SessionFlags, Smb2Command, Smb2Dialect};
use crate::protocol::messages::{Smb2NegotiateResponse, Smb2SessionSetupResponse, SmbMessage};
use crate::protocol::SMB1_MAGIC;
use crate::server::ServerConfig;
use std::sync::atomic::Ordering;

const ACCEPT_COMPLETED: [u8; 9] = [0xa1, 0x07, 0x30, 0x05, 0xa0, 0x03, 0x0a, 0x01, 0x00];

fn setup_response(body: &[u8]) -> Smb2SessionSetupResponse {
    Smb2SessionSetupResponse::parse(body).unwrap()
}

/// Run NEGOTIATE and the first SPNEGO wrapped round, returning the raw NTLM
/// challenge
async fn start_spnego(ctx: &mut TestContext) -> Vec<u8> {
    let (header, _) = ctx.negotiate().await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));

    let token = encode_neg_token_init(Some(&ntlm_negotiate()));
    let (header, body) = ctx.session_setup(&token).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::MoreProcessingRequired));
    assert_ne!(header.session_id, 0);

    let response = setup_response(&body);
    assert_eq!(response.security_blob[0], 0xa1);
    spnego_inner(&response.security_blob)
}

#[tokio::test]
async fn test_negotiate_advertises_spnego() {
    let mut ctx = TestContext::new().await.unwrap();

    let (header, body) = ctx.negotiate().await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));
    let response = Smb2NegotiateResponse::parse(&body).unwrap();
    assert_eq!(response.dialect, Smb2Dialect::Smb210);
    assert_eq!(response.security_blob[0], 0x60);
    assert!(response.system_time >= response.server_start_time);

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_spnego_ntlm_logon() {
    let mut ctx = TestContext::new().await.unwrap();

    let challenge = start_spnego(&mut ctx).await;
    assert!(NtlmChallengeMessage::parse(&challenge).is_ok());
    assert_eq!(ctx.live_contexts(), 1);

    let authenticate = ntlm_authenticate(&challenge, USER, PASSWORD);
    let token = encode_neg_token_resp(None, false, Some(&authenticate));
    let (header, body) = ctx.session_setup(&token).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));

    let response = setup_response(&body);
    assert_eq!(response.security_blob, ACCEPT_COMPLETED);
    assert!(!response.session_flags.contains(SessionFlags::IS_GUEST));
    assert_eq!(ctx.live_contexts(), 0);

    // Authenticated, but filesystem commands are not served here
    let (header, _) = ctx.request(Smb2Command::TreeConnect, &[]).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::NotSupported));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_raw_ntlmssp_logon() {
    let mut ctx = TestContext::new().await.unwrap();
    ctx.negotiate().await.unwrap();

    let (header, body) = ctx.session_setup(&ntlm_negotiate()).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::MoreProcessingRequired));
    let challenge = setup_response(&body).security_blob;
    // Not wrapped: the reply is the bare NTLM challenge
    assert!(challenge.starts_with(b"NTLMSSP\0"));

    let authenticate = ntlm_authenticate(&challenge, USER, PASSWORD);
    let (header, body) = ctx.session_setup(&authenticate).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));
    assert!(setup_response(&body).security_blob.is_empty());
    assert_eq!(ctx.live_contexts(), 0);

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password() {
    let mut ctx = TestContext::new().await.unwrap();

    let challenge = start_spnego(&mut ctx).await;
    let authenticate = ntlm_authenticate(&challenge, USER, "not-the-password");
    let token = encode_neg_token_resp(None, false, Some(&authenticate));
    let (header, _) = ctx.session_setup(&token).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::LogonFailure));
    assert_eq!(ctx.live_contexts(), 0);

    // The exchange is over; another round is refused outright
    let (header, _) = ctx.session_setup(&token).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::InvalidParameter));

    let (header, _) = ctx.request(Smb2Command::Create, &[]).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::AccessDenied));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_token_fails_logon() {
    let mut ctx = TestContext::new().await.unwrap();
    ctx.negotiate().await.unwrap();

    // Neither an NTLM signature nor valid DER
    let garbage = [0x30, 0x84, 0xff, 0xff, 0xff, 0xff, 0x01];
    let (header, body) = ctx.session_setup(&garbage).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::LogonFailure));
    // No parser detail reaches the wire
    assert!(setup_response(&body).security_blob.is_empty());
    assert_eq!(ctx.live_contexts(), 0);

    let (header, _) = ctx.request(Smb2Command::TreeConnect, &[]).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::AccessDenied));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_mid_handshake_releases_context() {
    let mut ctx = TestContext::new().await.unwrap();
    start_spnego(&mut ctx).await;
    assert_eq!(ctx.live_contexts(), 1);

    let live = ctx.live_counter();
    ctx.disconnect().await.unwrap();
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_commands_before_authentication_denied() {
    let mut ctx = TestContext::new().await.unwrap();
    ctx.negotiate().await.unwrap();

    for command in [
        Smb2Command::TreeConnect,
        Smb2Command::Create,
        Smb2Command::Read,
        Smb2Command::Ioctl,
    ] {
        let (header, _) = ctx.request(command, &[]).await.unwrap();
        assert_eq!(header.nt_status(), Some(NtStatus::AccessDenied));
    }

    // ECHO is part of the handshake surface
    let (header, _) = ctx.request(Smb2Command::Echo, &[4, 0, 0, 0]).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_guest_logon() {
    let config = ServerConfig {
        allow_guest: true,
        ..test_config()
    };
    let mut ctx = TestContext::with_config(config).await.unwrap();

    let challenge = start_spnego(&mut ctx).await;
    let authenticate = ntlm_authenticate(&challenge, "mallory", "whatever");
    let token = encode_neg_token_resp(None, false, Some(&authenticate));
    let (header, body) = ctx.session_setup(&token).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));
    assert!(setup_response(&body)
        .session_flags
        .contains(SessionFlags::IS_GUEST));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_logoff_ends_connection() {
    let mut ctx = TestContext::new().await.unwrap();
    let challenge = start_spnego(&mut ctx).await;
    let authenticate = ntlm_authenticate(&challenge, USER, PASSWORD);
    let token = encode_neg_token_resp(None, false, Some(&authenticate));
    ctx.session_setup(&token).await.unwrap();

    let (header, _) = ctx.request(Smb2Command::Logoff, &[4, 0, 0, 0]).await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));
    assert!(ctx.recv_frame().await.unwrap().is_none());

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_netbios_session_request() {
    let mut ctx = TestContext::new().await.unwrap();

    ctx.send_frame(NetBiosMessageType::SessionRequest, &[0x20; 68])
        .await
        .unwrap();
    let frame = ctx.recv_frame().await.unwrap().unwrap();
    assert_eq!(frame.message_type, NetBiosMessageType::PositiveResponse);

    let (header, _) = ctx.negotiate().await.unwrap();
    assert_eq!(header.nt_status(), Some(NtStatus::Success));

    ctx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_smb1_negotiate_upgrades_to_smb2() {
    let mut ctx = TestContext::new().await.unwrap();

    let mut packet = SMB1_MAGIC.to_vec();
    packet.extend_from_slice(&[0x72; 28]);
    ctx.send_frame(NetBiosMessageType::SessionMessage, &packet)
        .await
        .unwrap();

    let frame = ctx.recv_frame().await.unwrap().unwrap();
    let body = &frame.payload[64..];
    let response = Smb2NegotiateResponse::parse(body).unwrap();
    assert_eq!(response.dialect, Smb2Dialect::Smb202);

    ctx.disconnect().await.unwrap();
}
