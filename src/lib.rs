//! Session establishment and security negotiation for a multi-protocol file
//! server.
//!
//! Accepted associations are turned into [`session::ServerSession`]s by the
//! protocol's [`session::SessionFactory`]. Each session carries an
//! authentication exchange that advances one client token at a time, with
//! NTLMSSP tokens recognized in place and SPNEGO envelopes unwrapped without
//! copying.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod netbios;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub mod e2e_tests;

pub use error::{Error, NtStatus, Result};
