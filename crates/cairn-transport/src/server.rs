//! Server-side connections, built by the dispatcher for accepted
//! initial packets.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use cairn_core::{Configuration, ConnectionId, Ecn, SecureRandom, Timestamp, DEFAULT_CID_LEN};
use cairn_engine::tls::ServerContext;
use cairn_engine::{EngineError, EngineProvider, InitialHeader};

use crate::connection::{Connection, ConnectionError, ConnectionHandler, Path, Role, Status};
use crate::socket::Socket;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("engine setup failed: {0}")]
    Engine(EngineError),

    #[error("listening socket has no local address")]
    NoLocalAddress,
}

/// One accepted connection on a listening socket.
///
/// The peer's destination CID becomes the engine's `original_dcid`; a
/// fresh local source CID is generated here. The dispatcher owns the
/// instance and routes every matching datagram through
/// [`ServerConnection::process_packet`].
pub struct ServerConnection {
    connection: Connection,
}

impl ServerConnection {
    pub(crate) fn new(
        provider: &Arc<dyn EngineProvider<Path>>,
        configuration: Arc<Configuration>,
        tls: &ServerContext,
        socket: Arc<Socket>,
        remote_address: SocketAddr,
        header: &InitialHeader,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ServerError> {
        let local = socket.local_addr().ok_or(ServerError::NoLocalAddress)?;

        let mut random = SecureRandom::new();
        let scid = ConnectionId::random(DEFAULT_CID_LEN, &mut random)
            .expect("default connection id length is valid");

        let path = Path::new(local, remote_address, socket);
        let (engine, tls_session) = provider
            .server_new(
                header.scid,
                scid,
                header.dcid,
                None,
                path,
                header.version,
                &configuration,
                tls,
            )
            .map_err(ServerError::Engine)?;

        let connection = Connection::new(
            Role::Server,
            engine,
            tls_session,
            provider.crypto(),
            configuration,
            handler,
            None,
        );

        tracing::debug!(
            remote = %remote_address,
            original_dcid = %header.dcid,
            scid = %scid,
            "server connection created"
        );
        Ok(ServerConnection { connection })
    }

    /// Feed one routed datagram through the engine and flush whatever it
    /// produced. `Draining` starts the drain clock; `Retry` and `Drop`
    /// tell the dispatcher to discard the connection immediately.
    pub async fn process_packet(
        &mut self,
        path: &Path,
        data: &[u8],
        ecn: Ecn,
    ) -> Result<Status, ConnectionError> {
        let status = self.connection.receive_datagram(path, data, ecn).await?;
        if status != Status::Ok {
            return Ok(status);
        }
        self.connection.send_packets().await
    }

    pub fn client_initial_dcid(&self) -> Option<ConnectionId> {
        self.connection.client_initial_dcid()
    }

    pub fn source_cids(&self) -> Vec<ConnectionId> {
        self.connection.source_cids()
    }

    pub fn drained(&self, now: Timestamp) -> bool {
        self.connection.drained(now)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}
