//! Per-listening-socket CID routing.
//!
//! One dispatcher task owns a listening socket and every connection
//! accepted on it: the routing table maps each registered CID to a
//! connection serial, and the parallel storage table owns the
//! connections themselves. All access happens on the listening task, so
//! the maps need sequencing, not locking; the per-connection mutex only
//! serializes against the maintenance pass.
//!
//! Loop outcomes per datagram: route to the owning connection by DCID,
//! accept a new connection, answer with version negotiation, or drop.
//! Decode failures are per-datagram and never abort the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use cairn_core::{Configuration, ConnectionId, Ecn, Timestamp, DEFAULT_CID_LEN};
use cairn_engine::tls::ServerContext;
use cairn_engine::{DecodedHeader, EngineProvider, VersionCid};

use crate::connection::{ConnectionHandler, Path, Status};
use crate::server::ServerConnection;
use crate::socket::{Socket, SocketError, MAX_DATAGRAM_SIZE};

/// Granularity of expiry handling and drain reaping.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("listening socket is not bound")]
    NotBound,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Builds the application handler for each accepted connection.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>;

struct ConnectionEntry {
    connection: Arc<Mutex<ServerConnection>>,
    /// Every CID registered in the routing table for this connection.
    registered: Vec<ConnectionId>,
}

/// CID-routing demultiplexer for one listening socket.
pub struct Dispatcher {
    provider: Arc<dyn EngineProvider<Path>>,
    configuration: Arc<Configuration>,
    tls: ServerContext,
    handler_factory: HandlerFactory,
    routes: DashMap<ConnectionId, u64>,
    connections: DashMap<u64, ConnectionEntry>,
    next_serial: AtomicU64,
    shutdown: Notify,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn EngineProvider<Path>>,
        configuration: Arc<Configuration>,
        tls: ServerContext,
        handler_factory: HandlerFactory,
    ) -> Self {
        Dispatcher {
            provider,
            configuration,
            tls,
            handler_factory,
            routes: DashMap::new(),
            connections: DashMap::new(),
            next_serial: AtomicU64::new(0),
            shutdown: Notify::new(),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of registered CID routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Stop a running [`Dispatcher::listen`] loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Receive datagrams on `socket` and route them until shutdown or a
    /// socket failure. Runs expiry handling and drain reaping on a
    /// maintenance tick.
    pub async fn listen(&self, socket: Arc<Socket>) -> Result<(), DispatcherError> {
        let local = socket.local_addr().ok_or(DispatcherError::NotBound)?;
        tracing::info!(%local, "dispatcher listening");

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!(%local, "dispatcher shutting down");
                    return Ok(());
                }

                _ = maintenance.tick() => {
                    self.maintain().await;
                }

                received = socket.receive_packet(&mut buffer, None) => {
                    match received {
                        Ok(Some(datagram)) => {
                            self.handle_datagram(
                                &socket,
                                local,
                                &buffer[..datagram.len],
                                datagram.remote,
                                datagram.ecn,
                            )
                            .await;
                        }
                        Ok(None) => {}
                        Err(SocketError::Closed) => {
                            tracing::info!(%local, "listening socket closed");
                            return Ok(());
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        socket: &Arc<Socket>,
        local: SocketAddr,
        data: &[u8],
        remote: SocketAddr,
        ecn: Ecn,
    ) {
        match self.provider.decode_version_cid(data, DEFAULT_CID_LEN) {
            Ok(DecodedHeader::Route(header)) => {
                let serial = self.routes.get(&header.dcid).map(|entry| *entry.value());
                match serial {
                    Some(serial) => self.deliver(serial, socket, local, data, remote, ecn).await,
                    None => self.accept(socket, local, data, remote, ecn).await,
                }
            }
            Ok(DecodedHeader::NegotiateVersion(header)) => {
                self.send_version_negotiation(socket, &header, remote).await;
            }
            Err(error) => {
                tracing::debug!(%remote, error = %error, "undecodable datagram dropped");
            }
        }
    }

    /// Route a datagram to an existing connection.
    async fn deliver(
        &self,
        serial: u64,
        socket: &Arc<Socket>,
        local: SocketAddr,
        data: &[u8],
        remote: SocketAddr,
        ecn: Ecn,
    ) {
        let Some(connection) = self
            .connections
            .get(&serial)
            .map(|entry| entry.connection.clone())
        else {
            return;
        };

        let path = Path::new(local, remote, socket.clone());
        let result = {
            let mut guard = connection.lock().await;
            guard.process_packet(&path, data, ecn).await
        };

        match result {
            Ok(Status::Ok) => self.sync_registrations(serial).await,
            Ok(Status::Draining) => {
                tracing::debug!(serial, "connection entered draining");
            }
            Ok(Status::Closing) => {}
            Ok(Status::Retry | Status::Drop) => {
                tracing::debug!(serial, "connection dropped");
                self.remove(serial).await;
            }
            Err(error) => {
                tracing::warn!(serial, error = %error, "connection processing failed");
                self.remove(serial).await;
            }
        }
    }

    /// A datagram with an unknown DCID: validate it as a new connection's
    /// initial packet and create the server side for it.
    async fn accept(
        &self,
        socket: &Arc<Socket>,
        local: SocketAddr,
        data: &[u8],
        remote: SocketAddr,
        ecn: Ecn,
    ) {
        let header = match self.provider.accept(data) {
            Ok(header) => header,
            Err(error) => {
                tracing::debug!(%remote, error = %error, "initial packet rejected");
                return;
            }
        };

        let handler = (self.handler_factory)();
        let server = match ServerConnection::new(
            &self.provider,
            self.configuration.clone(),
            &self.tls,
            socket.clone(),
            remote,
            &header,
            handler,
        ) {
            Ok(server) => server,
            Err(error) => {
                tracing::warn!(%remote, error = %error, "failed to create server connection");
                return;
            }
        };

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Mutex::new(server));
        self.connections.insert(
            serial,
            ConnectionEntry {
                connection: connection.clone(),
                registered: Vec::new(),
            },
        );
        self.register(serial, header.dcid);
        tracing::info!(%remote, dcid = %header.dcid, serial, "accepted connection");

        let path = Path::new(local, remote, socket.clone());
        let result = {
            let mut guard = connection.lock().await;
            guard.process_packet(&path, data, ecn).await
        };
        match result {
            Ok(Status::Ok) => self.sync_registrations(serial).await,
            Ok(status) => {
                tracing::debug!(serial, ?status, "connection ended during accept");
                self.remove(serial).await;
            }
            Err(error) => {
                tracing::warn!(serial, error = %error, "initial packet processing failed");
                self.remove(serial).await;
            }
        }
    }

    /// Register any source CIDs the engine has issued since the last
    /// pass, so every CID the connection answers to routes back to it.
    async fn sync_registrations(&self, serial: u64) {
        let Some(connection) = self
            .connections
            .get(&serial)
            .map(|entry| entry.connection.clone())
        else {
            return;
        };
        let cids = { connection.lock().await.source_cids() };
        for cid in cids {
            self.register(serial, cid);
        }
    }

    fn register(&self, serial: u64, cid: ConnectionId) {
        let already = self
            .connections
            .get(&serial)
            .map(|entry| entry.registered.contains(&cid))
            .unwrap_or(true);
        if already {
            return;
        }
        if let Some(previous) = self.routes.insert(cid, serial) {
            if previous != serial {
                tracing::error!(%cid, previous, serial, "connection id registered twice");
            }
        }
        if let Some(mut entry) = self.connections.get_mut(&serial) {
            entry.registered.push(cid);
        }
        tracing::trace!(%cid, serial, "connection id registered");
    }

    /// Deregister every CID of a connection and release its storage.
    async fn remove(&self, serial: u64) {
        let Some((_, entry)) = self.connections.remove(&serial) else {
            return;
        };
        for cid in &entry.registered {
            self.routes.remove(cid);
        }
        let mut guard = entry.connection.lock().await;
        guard.connection_mut().disconnect().await;
        guard.connection_mut().mark_closed();
        tracing::info!(serial, cids = entry.registered.len(), "connection removed");
    }

    /// Fire due expiry timers and reap connections whose drain period
    /// has elapsed.
    async fn maintain(&self) {
        let now = Timestamp::now();
        let serials: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();

        for serial in serials {
            let Some(connection) = self
                .connections
                .get(&serial)
                .map(|entry| entry.connection.clone())
            else {
                continue;
            };
            let mut guard = connection.lock().await;

            if guard.drained(now) {
                drop(guard);
                self.remove(serial).await;
                continue;
            }

            let due = guard
                .connection()
                .expiry_timeout()
                .map(|expiry| now >= expiry)
                .unwrap_or(false);
            if due {
                match guard.connection_mut().handle_expiry().await {
                    Ok(Status::Ok) => {}
                    Ok(status) => {
                        tracing::debug!(serial, ?status, "connection expired");
                    }
                    Err(error) => {
                        tracing::warn!(serial, error = %error, "expiry handling failed");
                        drop(guard);
                        self.remove(serial).await;
                    }
                }
            }
        }
    }

    async fn send_version_negotiation(
        &self,
        socket: &Arc<Socket>,
        header: &VersionCid,
        remote: SocketAddr,
    ) {
        let mut buffer = [0u8; 256];
        match self.provider.write_version_negotiation(&mut buffer, header) {
            Ok(0) => {}
            Ok(len) => {
                match socket
                    .send_packet(&buffer[..len], remote, Ecn::NotEct, None)
                    .await
                {
                    Ok(_) => {
                        tracing::debug!(%remote, version = header.version, "sent version negotiation");
                    }
                    Err(error) => {
                        tracing::debug!(%remote, error = %error, "version negotiation send failed");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to write version negotiation");
            }
        }
    }
}
