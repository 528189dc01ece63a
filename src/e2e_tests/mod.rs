//! End-to-end tests driving the server over loopback TCP

pub mod loopback;
pub mod test_context;

mod handshake;

pub use loopback::LoopbackTransport;
pub use test_context::TestContext;
