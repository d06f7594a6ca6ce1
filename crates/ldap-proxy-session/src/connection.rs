//! Client connection seam

use std::time::Instant;

/// The client side of a proxied connection, as seen by the handlers.
///
/// The socket is owned by the dispatcher. Handlers only read its endpoints,
/// arm its deadline and ask it to close.
pub trait ClientConnection: Send + Sync {
    /// Local endpoint (`ip:port`) the client connected to
    fn local_addr(&self) -> String;

    /// Remote endpoint (`ip:port`) of the client
    fn peer_addr(&self) -> String;

    /// Fail client reads and writes that have not completed by `deadline`
    fn set_deadline(&self, deadline: Instant);

    /// Close the client socket
    fn close(&self);
}
