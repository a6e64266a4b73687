//! Cairn — transport orchestration for a QUIC endpoint.
//!
//! Everything between an external QUIC packet engine and the
//! application: ECN/PMTU-aware UDP sockets, stream byte buffers with
//! acknowledgement-based retirement, per-connection drivers for both
//! roles, and the CID-routing dispatcher that demultiplexes a listening
//! socket into connections.

pub mod buffer;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod server;
pub mod socket;
pub mod stream;

pub use buffer::{BufferError, InputBuffer, OutputBuffer};
pub use client::{Client, ClientError};
pub use connection::{
    Connection, ConnectionError, ConnectionHandler, Path, Phase, Role, Status,
};
pub use dispatcher::{Dispatcher, DispatcherError, HandlerFactory};
pub use server::{ServerConnection, ServerError};
pub use socket::{Received, Socket, SocketError, MAX_DATAGRAM_SIZE};
pub use stream::{ShutdownRequest, Stream};
