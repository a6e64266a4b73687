//! Client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use cairn_core::{Configuration, ConnectionId, SecureRandom, DEFAULT_CID_LEN};
use cairn_engine::tls::ClientContext;
use cairn_engine::{EngineError, EngineProvider};

use crate::connection::{Connection, ConnectionError, ConnectionHandler, Path, Role, Status};
use crate::socket::{Socket, SocketError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("engine setup failed: {0}")]
    Engine(EngineError),

    #[error("socket has no local address")]
    NoLocalAddress,
}

/// A client connection with its own connected socket.
///
/// The constructor generates a fresh source CID and a random destination
/// CID, builds the initial path, and hands both to the engine;
/// [`Client::connect`] then drives the send/receive loop until a
/// terminal status.
pub struct Client {
    connection: Connection,
    path: Path,
}

impl Client {
    pub fn new(
        provider: &Arc<dyn EngineProvider<Path>>,
        configuration: Arc<Configuration>,
        tls: ClientContext,
        remote_address: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ClientError> {
        let socket = Arc::new(Socket::connected(remote_address)?);
        let local = socket.local_addr().ok_or(ClientError::NoLocalAddress)?;

        let mut random = SecureRandom::new();
        let dcid = ConnectionId::random(DEFAULT_CID_LEN, &mut random)
            .expect("default connection id length is valid");
        let scid = ConnectionId::random(DEFAULT_CID_LEN, &mut random)
            .expect("default connection id length is valid");

        let path = Path::new(local, remote_address, socket.clone());
        let version = configuration.preferred_version();
        let (engine, tls_session) = provider
            .client_new(dcid, scid, path.clone(), version, &configuration, &tls)
            .map_err(ClientError::Engine)?;

        let connection = Connection::new(
            Role::Client,
            engine,
            tls_session,
            provider.crypto(),
            configuration,
            handler,
            Some(socket),
        );

        tracing::info!(remote = %remote_address, dcid = %dcid, scid = %scid, "client connection created");
        Ok(Client { connection, path })
    }

    /// Drive the connection until a terminal status, alternating a send
    /// pass with one receive. Returns on draining or closing.
    pub async fn connect(&mut self) -> Result<Status, ConnectionError> {
        loop {
            let status = self.connection.send_packets().await?;
            if status != Status::Ok {
                return Ok(status);
            }
            let status = self.connection.receive_packets(&self.path, 1).await?;
            if status != Status::Ok {
                return Ok(status);
            }
        }
    }

    /// Wait out the drain period after a close, so the peer's own close
    /// exchange can finish before the socket goes away.
    pub async fn drain(&self) {
        tokio::time::sleep(self.connection.close_duration()).await;
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Phase;
    use cairn_engine::testing::LoopbackProvider;

    fn test_client() -> Client {
        let provider: Arc<dyn EngineProvider<Path>> = Arc::new(LoopbackProvider::new());
        let configuration = Arc::new(Configuration::new());
        Client::new(
            &provider,
            configuration,
            ClientContext::new("localhost"),
            "127.0.0.1:61000".parse().unwrap(),
            Box::new(()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut client = test_client();
        assert_eq!(client.connection().phase(), Phase::Active);

        client.connection_mut().disconnect().await;
        let phase = client.connection().phase();
        assert!(phase >= Phase::Draining);
        assert_eq!(client.connection().stream_count(), 0);

        // A second disconnect observes the same outcome.
        client.connection_mut().disconnect().await;
        assert_eq!(client.connection().phase(), phase);

        // Terminal: no pass ever reports progress again.
        let status = client.connection_mut().send_packets().await.unwrap();
        assert_ne!(status, Status::Ok);
    }

    #[tokio::test]
    async fn phases_never_move_backwards() {
        let mut client = test_client();
        client.connection_mut().close().await.unwrap();
        assert!(client.connection().phase() >= Phase::Draining);

        // Feeding more datagrams cannot resurrect the connection.
        let path = client.path().clone();
        let status = client
            .connection_mut()
            .receive_datagram(&path, &[0u8; 8], cairn_core::Ecn::NotEct)
            .await
            .unwrap();
        assert_ne!(status, Status::Ok);
        assert!(client.connection().phase() >= Phase::Draining);
    }
}
