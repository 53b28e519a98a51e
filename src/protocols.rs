//! Transport traits for the DHT's networking seam.
//!
//! The DHT engine is generic over [`Transport`]; it never touches sockets,
//! framing or connection caching directly.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Transport`] | Open a listening socket, or dial a peer address |
//! | [`Socket`] | Send and receive whole [`Message`] envelopes |
//!
//! A listening socket yields every envelope addressed to the local node,
//! requests and responses alike. A dialed socket is used to deliver
//! envelopes to one remote address; replies arrive on the listener, never
//! on the dialed socket.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::Message;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Socket: Socket;

    /// Bind `addr`. The returned socket's [`Socket::local_addr`] reports the
    /// address peers should use, which may differ when `addr` requests an
    /// ephemeral port.
    async fn listen(&self, addr: &str) -> Result<Self::Socket>;

    async fn dial(&self, addr: &str) -> Result<Self::Socket>;
}

#[async_trait]
pub trait Socket: Send + Sync + 'static {
    async fn send(&self, msg: &Message) -> Result<()>;

    /// Wait for the next inbound envelope. Fails once the socket is closed.
    async fn receive(&self) -> Result<Message>;

    fn local_addr(&self) -> String;

    async fn close(&self);
}
