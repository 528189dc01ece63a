//! SMB2 protocol definitions

pub mod constants;
pub mod header;
pub mod messages;

pub use constants::{Smb2Command, Smb2Dialect, SMB1_MAGIC, SMB2_HEADER_SIZE, SMB2_MAGIC};
pub use header::Smb2Header;
