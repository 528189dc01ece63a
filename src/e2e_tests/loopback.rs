//! Loopback connections for end-to-end tests
//!
//! Client and server run in-process, talking over a real TCP connection on
//! localhost.

use crate::error::Result;
use tokio::net::{TcpListener, TcpStream};

pub struct LoopbackTransport;

impl LoopbackTransport {
    /// Create a connected `(client, server)` pair using TCP on localhost
    pub async fn new() -> Result<(TcpStream, TcpStream)> {
        // Bind to a random port on localhost
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let client_future = TcpStream::connect(addr);
        let server_future = async { listener.accept().await.map(|(stream, _)| stream) };

        let (client_stream, server_stream) = tokio::try_join!(client_future, server_future)?;

        Ok((client_stream, server_stream))
    }
}
