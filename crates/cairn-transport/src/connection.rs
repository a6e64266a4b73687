//! Per-connection driver.
//!
//! A `Connection` owns the engine handle, the stream table and the
//! last-error record, and sequences engine calls, packet I/O and timer
//! expiry. Engine callbacks land on [`ConnectionState`], which the
//! borrow checker keeps from re-entering the engine: anything a callback
//! wants sent is flagged and flushed once the engine call returns.
//!
//! Callback bodies follow the trampoline contract: internal failures are
//! recorded in the last-error slot and surface to the engine as
//! [`CallbackFailure`], never as an unwind through it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use cairn_core::{
    Configuration, ConnectionId, Ecn, FastRandom, SecureRandom, Timestamp, MAX_CID_LEN,
};
use cairn_engine::{
    CallbackFailure, CallbackResult, CloseError, ConnectionEvents, CryptoHelper, Engine,
    EngineError, NetworkPath, PacketInfo, ResetToken, StreamId, StreamWrite,
};
use cairn_engine::tls::TlsSession;

use crate::socket::{Socket, SocketError, MAX_DATAGRAM_SIZE};
use crate::stream::{ShutdownRequest, Stream};

/// QUIC INTERNAL_ERROR, recorded when an invariant trips.
const INTERNAL_ERROR: i64 = 0x01;

/// The path an engine I/O happened on: addresses plus the socket that
/// carried (or must carry) the datagram. Constructed at each send and
/// receive, never stored in the connection.
#[derive(Clone)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub socket: Arc<Socket>,
}

impl Path {
    pub fn new(local: SocketAddr, remote: SocketAddr, socket: Arc<Socket>) -> Self {
        Path {
            local,
            remote,
            socket,
        }
    }
}

impl NetworkPath for Path {
    fn local(&self) -> SocketAddr {
        self.local
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path({} -> {})", self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle. Transitions are monotonic; there is no way back
/// from draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Active,
    Closing,
    Draining,
    Closed,
}

/// Outcome of a send or receive pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Draining,
    Closing,
    Retry,
    Drop,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is disconnected")]
    Disconnected,

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Application hooks on a connection.
///
/// `stream_opened`, `stream_data` and `stream_closed` run inside engine
/// callbacks and may only touch the stream's buffers — writes are
/// flushed by the connection's next send pass. `established` runs after
/// the engine call returns and gets the full connection, so it may open
/// streams.
pub trait ConnectionHandler: Send {
    fn established(&mut self, _connection: &mut Connection) {}
    fn stream_opened(&mut self, _stream: &mut Stream) {}
    fn stream_data(&mut self, _stream: &mut Stream) {}
    fn stream_closed(&mut self, _stream_id: StreamId, _error_code: u64) {}
}

/// No-op handler for connections driven entirely by the application.
impl ConnectionHandler for () {}

/// The callback-facing half of a connection: stream table, last error,
/// randomness and configuration.
pub(crate) struct ConnectionState {
    role: Role,
    streams: HashMap<StreamId, Stream>,
    last_error: Option<CloseError>,
    fault: Option<&'static str>,
    secure: SecureRandom,
    fast: FastRandom,
    crypto: Arc<dyn CryptoHelper>,
    configuration: Arc<Configuration>,
    handler: Option<Box<dyn ConnectionHandler>>,
    handshake_completed: bool,
    established_notified: bool,
    max_local_bidi_streams: u64,
    max_local_uni_streams: u64,
}

impl ConnectionState {
    fn new(
        role: Role,
        crypto: Arc<dyn CryptoHelper>,
        configuration: Arc<Configuration>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        ConnectionState {
            role,
            streams: HashMap::new(),
            last_error: None,
            fault: None,
            secure: SecureRandom::new(),
            fast: FastRandom::new(),
            crypto,
            configuration,
            handler: Some(handler),
            handshake_completed: false,
            established_notified: false,
            max_local_bidi_streams: 0,
            max_local_uni_streams: 0,
        }
    }

    /// Record an invariant violation and fail the callback. The engine
    /// will abort this connection; the dispatcher keeps running.
    fn fail(&mut self, diagnostic: &'static str) -> CallbackResult {
        tracing::error!(role = ?self.role, diagnostic, "connection invariant violated");
        self.fault = Some(diagnostic);
        if self.last_error.is_none() {
            self.last_error = Some(CloseError::Transport(INTERNAL_ERROR));
        }
        Err(CallbackFailure)
    }

    fn with_handler(&mut self, call: impl FnOnce(&mut dyn ConnectionHandler, &mut Self)) {
        if let Some(mut handler) = self.handler.take() {
            call(handler.as_mut(), self);
            self.handler = Some(handler);
        }
    }
}

impl ConnectionEvents for ConnectionState {
    fn handshake_completed(&mut self) -> CallbackResult {
        self.handshake_completed = true;
        Ok(())
    }

    fn extend_max_local_bidi_streams(&mut self, max_streams: u64) -> CallbackResult {
        self.max_local_bidi_streams = max_streams;
        Ok(())
    }

    fn extend_max_local_uni_streams(&mut self, max_streams: u64) -> CallbackResult {
        self.max_local_uni_streams = max_streams;
        Ok(())
    }

    fn stream_open(&mut self, stream_id: StreamId) -> CallbackResult {
        if self.streams.contains_key(&stream_id) {
            return self.fail("engine opened a duplicate stream id");
        }
        self.streams.insert(stream_id, Stream::new(stream_id));
        tracing::debug!(stream_id, "remote stream opened");
        self.with_handler(|handler, state| {
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                handler.stream_opened(stream);
            }
        });
        Ok(())
    }

    fn stream_close(&mut self, stream_id: StreamId, error_code: u64) -> CallbackResult {
        // Only the engine's close callback removes table entries.
        if self.streams.remove(&stream_id).is_some() {
            tracing::debug!(stream_id, error_code, "stream closed");
            self.with_handler(|handler, _| handler.stream_closed(stream_id, error_code));
        }
        Ok(())
    }

    fn stream_reset(
        &mut self,
        stream_id: StreamId,
        final_size: u64,
        error_code: u64,
    ) -> CallbackResult {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        tracing::debug!(stream_id, final_size, error_code, "peer reset stream");
        stream.output_mut().close(Some(error_code));
        Ok(())
    }

    fn stream_stop_sending(&mut self, stream_id: StreamId, error_code: u64) -> CallbackResult {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        tracing::debug!(stream_id, error_code, "peer stopped reading");
        stream.input_mut().close(Some(error_code));
        Ok(())
    }

    fn extend_max_stream_data(&mut self, stream_id: StreamId, max_data: u64) -> CallbackResult {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        tracing::trace!(stream_id, max_data, "flow control extended");
        stream.mark_send();
        Ok(())
    }

    fn receive_stream_data(
        &mut self,
        stream_id: StreamId,
        _offset: u64,
        data: &[u8],
        fin: bool,
    ) -> CallbackResult {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return self.fail("stream data for an unknown stream");
        };
        if stream.input_mut().append(data).is_err() {
            return self.fail("stream data after input close");
        }
        if fin {
            stream.input_mut().close(None);
        }
        stream.mark_send();
        self.with_handler(|handler, state| {
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                handler.stream_data(stream);
            }
        });
        Ok(())
    }

    fn acked_stream_data_offset(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        length: u64,
    ) -> CallbackResult {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let output = stream.output();
        if offset != output.acknowledged() {
            return self.fail("non-contiguous acknowledgement");
        }
        if output.acknowledged() + length > output.written() {
            return self.fail("acknowledged past written offset");
        }
        stream.output_mut().acknowledge(length);
        Ok(())
    }

    fn new_connection_id(
        &mut self,
        length: usize,
    ) -> Result<(ConnectionId, ResetToken), CallbackFailure> {
        if length == 0 || length > MAX_CID_LEN {
            tracing::warn!(length, "engine requested invalid connection id length");
            return Err(CallbackFailure);
        }
        let cid = ConnectionId::random(length, &mut self.secure).map_err(|error| {
            tracing::warn!(error = %error, "connection id generation failed");
            CallbackFailure
        })?;
        let token = self
            .crypto
            .stateless_reset_token(self.configuration.static_secret(), &cid)
            .map_err(|error| {
                tracing::warn!(error = %error, "stateless reset token derivation failed");
                CallbackFailure
            })?;
        Ok((cid, token))
    }

    fn random(&mut self, buffer: &mut [u8]) {
        self.fast.fill(buffer);
    }
}

/// One QUIC connection, client or server side.
pub struct Connection {
    engine: Option<Box<dyn Engine<Path>>>,
    tls: Option<Box<dyn TlsSession>>,
    state: ConnectionState,
    phase: Phase,
    drain_deadline: Option<Timestamp>,
    /// Set when this connection owns its socket (clients); closed on
    /// `close()`. Server connections share the listener's socket.
    owned_socket: Option<Arc<Socket>>,
    cached_pto: Duration,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        engine: Box<dyn Engine<Path>>,
        tls: Box<dyn TlsSession>,
        crypto: Arc<dyn CryptoHelper>,
        configuration: Arc<Configuration>,
        handler: Box<dyn ConnectionHandler>,
        owned_socket: Option<Arc<Socket>>,
    ) -> Self {
        let cached_pto = engine.pto();
        Connection {
            engine: Some(engine),
            tls: Some(tls),
            state: ConnectionState::new(role, crypto, configuration, handler),
            phase: Phase::Active,
            drain_deadline: None,
            owned_socket,
            cached_pto,
        }
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.state.handshake_completed
    }

    pub fn is_closing(&self) -> bool {
        self.engine
            .as_ref()
            .map(|engine| engine.is_in_closing_period())
            .unwrap_or(self.phase == Phase::Closing)
    }

    pub fn is_draining(&self) -> bool {
        self.engine
            .as_ref()
            .map(|engine| engine.is_in_draining_period())
            .unwrap_or(self.phase >= Phase::Draining)
    }

    pub fn last_error(&self) -> Option<CloseError> {
        self.state.last_error
    }

    /// Diagnostic for an invariant fault, if one aborted this connection.
    pub fn fault(&self) -> Option<&'static str> {
        self.state.fault
    }

    pub fn tls_session(&self) -> Option<&dyn TlsSession> {
        self.tls.as_deref()
    }

    /// Streams the peer currently allows us to open.
    pub fn max_local_bidi_streams(&self) -> u64 {
        self.state.max_local_bidi_streams
    }

    pub fn max_local_uni_streams(&self) -> u64 {
        self.state.max_local_uni_streams
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.state.streams.get(&stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.state.streams.get_mut(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.state.streams.len()
    }

    /// Ask the engine for a new bidirectional stream id and register it.
    pub fn open_bidirectional_stream(&mut self) -> Result<StreamId, ConnectionError> {
        let engine = self.engine.as_mut().ok_or(ConnectionError::Disconnected)?;
        let stream_id = engine.open_bidi_stream().map_err(ConnectionError::Engine)?;
        if self.state.streams.contains_key(&stream_id) {
            return Err(ConnectionError::Invariant(
                "engine assigned a duplicate stream id",
            ));
        }
        self.state.streams.insert(stream_id, Stream::new(stream_id));
        tracing::debug!(stream_id, "opened bidirectional stream");
        Ok(stream_id)
    }

    pub fn open_unidirectional_stream(&mut self) -> Result<StreamId, ConnectionError> {
        let engine = self.engine.as_mut().ok_or(ConnectionError::Disconnected)?;
        let stream_id = engine.open_uni_stream().map_err(ConnectionError::Engine)?;
        if self.state.streams.contains_key(&stream_id) {
            return Err(ConnectionError::Invariant(
                "engine assigned a duplicate stream id",
            ));
        }
        self.state.streams.insert(stream_id, Stream::new(stream_id));
        tracing::debug!(stream_id, "opened unidirectional stream");
        Ok(stream_id)
    }

    /// Tell the peer to stop sending on `stream_id`.
    pub fn shutdown_stream_read(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), ConnectionError> {
        let engine = self.engine.as_mut().ok_or(ConnectionError::Disconnected)?;
        engine
            .shutdown_stream_read(stream_id, error_code)
            .map_err(ConnectionError::Engine)
    }

    /// Reset the send side of `stream_id`.
    pub fn shutdown_stream_write(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), ConnectionError> {
        let engine = self.engine.as_mut().ok_or(ConnectionError::Disconnected)?;
        engine
            .shutdown_stream_write(stream_id, error_code)
            .map_err(ConnectionError::Engine)?;
        if let Some(stream) = self.state.streams.get_mut(&stream_id) {
            stream.output_mut().close(Some(error_code));
        }
        Ok(())
    }

    pub fn shutdown_stream(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), ConnectionError> {
        let engine = self.engine.as_mut().ok_or(ConnectionError::Disconnected)?;
        engine
            .shutdown_stream(stream_id, error_code)
            .map_err(ConnectionError::Engine)?;
        if let Some(stream) = self.state.streams.get_mut(&stream_id) {
            stream.output_mut().close(Some(error_code));
        }
        Ok(())
    }

    /// The client-chosen initial destination CID (servers keep it
    /// registered for routing).
    pub fn client_initial_dcid(&self) -> Option<ConnectionId> {
        self.engine.as_ref().map(|engine| engine.client_initial_dcid())
    }

    /// Every source CID this connection answers to.
    pub fn source_cids(&self) -> Vec<ConnectionId> {
        self.engine
            .as_ref()
            .map(|engine| engine.source_cids())
            .unwrap_or_default()
    }

    /// Absolute time of the engine's next timer.
    pub fn expiry_timeout(&self) -> Option<Timestamp> {
        self.engine.as_ref().and_then(|engine| engine.expiry())
    }

    /// How long a closed connection lingers before it is reaped.
    pub fn close_duration(&self) -> Duration {
        let pto = self
            .engine
            .as_ref()
            .map(|engine| engine.pto())
            .unwrap_or(self.cached_pto);
        pto * 3
    }

    /// Deadline after which a draining connection can be reaped.
    pub fn drain_deadline(&self) -> Option<Timestamp> {
        self.drain_deadline
    }

    /// True once the drain period has elapsed.
    pub fn drained(&self, now: Timestamp) -> bool {
        self.phase >= Phase::Draining
            && self
                .drain_deadline
                .map(|deadline| now >= deadline)
                .unwrap_or(true)
    }

    pub(crate) fn mark_closed(&mut self) {
        self.advance_phase(Phase::Closed);
    }

    /// Flush pending control frames and stream data: one engine control
    /// pass, then a send loop per open stream.
    pub async fn send_packets(&mut self) -> Result<Status, ConnectionError> {
        self.flush_shutdown_requests();

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let now = Timestamp::now();
            let Some(engine) = self.engine.as_mut() else {
                return Ok(self.terminal_status());
            };
            let write = match engine.write_stream(&mut buffer, None, &[], false, now) {
                Ok(write) => write,
                Err(error) => return self.on_engine_error(error).await,
            };
            if write.packet == 0 {
                break;
            }
            send_datagram(&buffer[..write.packet], &write).await?;
        }

        let stream_ids: Vec<StreamId> = self.state.streams.keys().copied().collect();
        for stream_id in stream_ids {
            let status = self.send_stream_data(stream_id, &mut buffer).await?;
            if status != Status::Ok {
                return Ok(status);
            }
        }
        Ok(Status::Ok)
    }

    /// Drive the engine's stream write loop until it reports zero
    /// progress with nothing pending, the stream is shut for writing, or
    /// flow control blocks.
    async fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        buffer: &mut [u8],
    ) -> Result<Status, ConnectionError> {
        loop {
            let now = Timestamp::now();
            let Some(engine) = self.engine.as_mut() else {
                return Ok(self.terminal_status());
            };
            let Some(stream) = self.state.streams.get_mut(&stream_id) else {
                return Ok(Status::Ok);
            };

            let fin = stream.output().is_closed();
            let write = {
                let chunks = stream.output().pending_chunks();
                engine.write_stream(buffer, Some(stream_id), &chunks, fin, now)
            };

            match write {
                Err(EngineError::StreamShutWrite) => {
                    // The stream's send side is gone; pending chunks will
                    // never be written.
                    stream.output_mut().stop_sending();
                    stream.clear_send();
                    return Ok(Status::Ok);
                }
                Err(EngineError::StreamDataBlocked) => {
                    // Flow control: wait for the peer's extension, which
                    // re-flags the stream.
                    stream.clear_send();
                    return Ok(Status::Ok);
                }
                Err(error) => return self.on_engine_error(error).await,
                Ok(write) => {
                    if write.consumed > 0 {
                        stream.output_mut().increment(write.consumed as u64);
                    }
                    let progress = write.packet > 0 || write.consumed > 0;
                    if write.packet > 0 {
                        send_datagram(&buffer[..write.packet], &write).await?;
                    }
                    if !progress {
                        if let Some(stream) = self.state.streams.get_mut(&stream_id) {
                            stream.clear_send();
                        }
                        return Ok(Status::Ok);
                    }
                }
            }
        }
    }

    /// Feed one received datagram to the engine; callbacks fire before
    /// this returns, deferred work right after.
    pub async fn receive_datagram(
        &mut self,
        path: &Path,
        data: &[u8],
        ecn: Ecn,
    ) -> Result<Status, ConnectionError> {
        let now = Timestamp::now();
        let Some(engine) = self.engine.as_mut() else {
            return Ok(self.terminal_status());
        };
        let info = PacketInfo { ecn };
        match engine.read_packet(path, &info, data, now, &mut self.state) {
            Ok(()) => {
                self.notify_established();
                self.flush_shutdown_requests();
                Ok(Status::Ok)
            }
            Err(error) => self.on_engine_error(error).await,
        }
    }

    /// Receive up to `count` datagrams from `path`. A timed-out wait
    /// (the engine's expiry deadline passed) runs expiry handling and
    /// does not count.
    pub async fn receive_packets(
        &mut self,
        path: &Path,
        count: usize,
    ) -> Result<Status, ConnectionError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut remaining = count;
        while remaining > 0 {
            if self.engine.is_none() {
                return Ok(self.terminal_status());
            }
            let deadline = self.expiry_timeout();
            match path.socket.receive_packet(&mut buffer, deadline).await? {
                None => {
                    let status = self.handle_expiry().await?;
                    if status != Status::Ok {
                        return Ok(status);
                    }
                }
                Some(received) => {
                    let receive_path =
                        Path::new(path.local, received.remote, path.socket.clone());
                    let status = self
                        .receive_datagram(&receive_path, &buffer[..received.len], received.ecn)
                        .await?;
                    if status != Status::Ok {
                        return Ok(status);
                    }
                    remaining -= 1;
                }
            }
        }
        Ok(Status::Ok)
    }

    /// Run engine timers; on success flush whatever they produced, on
    /// failure record the error and tear the connection down.
    pub async fn handle_expiry(&mut self) -> Result<Status, ConnectionError> {
        let now = Timestamp::now();
        let Some(engine) = self.engine.as_mut() else {
            return Ok(self.terminal_status());
        };
        match engine.handle_expiry(now, &mut self.state) {
            Ok(()) => self.send_packets().await,
            Err(error) => {
                tracing::debug!(error = %error, "expiry handling failed");
                self.on_engine_error(error).await
            }
        }
    }

    /// Produce one CONNECTION_CLOSE datagram (when the engine is not
    /// already past that point), send it honoring the expiry timeout,
    /// and enter the drain period. Closes an owned socket.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let now = Timestamp::now();
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        self.cached_pto = engine.pto();

        if engine.is_in_closing_period() || engine.is_in_draining_period() {
            self.advance_phase(Phase::Draining);
            self.arm_drain(now);
            if let Some(socket) = &self.owned_socket {
                socket.close();
            }
            return Ok(());
        }

        let error = self.state.last_error.unwrap_or_default();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let write = engine
            .write_connection_close(&mut buffer, &error, now)
            .map_err(ConnectionError::Engine)?;

        self.advance_phase(Phase::Closing);
        if write.packet > 0 {
            let deadline = Some(now + self.close_duration());
            if let Some(path) = write.path.as_ref() {
                if let Err(send_error) = path
                    .socket
                    .send_packet(&buffer[..write.packet], path.remote, write.ecn, deadline)
                    .await
                {
                    tracing::debug!(error = %send_error, "failed to send connection close");
                }
            }
        }

        self.advance_phase(Phase::Draining);
        self.arm_drain(now);
        if let Some(socket) = &self.owned_socket {
            socket.close();
        }
        Ok(())
    }

    /// Close, propagate to every stream, and delete the engine handle.
    /// Terminal and idempotent.
    pub async fn disconnect(&mut self) {
        if self.engine.is_none() {
            return;
        }
        if let Err(error) = self.close().await {
            tracing::debug!(error = %error, "close during disconnect failed");
        }
        for stream in self.state.streams.values_mut() {
            stream.disconnect();
        }
        self.state.streams.clear();
        self.engine = None;
        self.tls = None;
        tracing::debug!(role = ?self.state.role, "disconnected");
    }

    fn notify_established(&mut self) {
        if self.state.handshake_completed && !self.state.established_notified {
            self.state.established_notified = true;
            tracing::debug!(role = ?self.state.role, "handshake completed");
            if let Some(mut handler) = self.state.handler.take() {
                handler.established(self);
                self.state.handler = Some(handler);
            }
        }
    }

    /// Service shutdown requests queued on streams by handler hooks.
    fn flush_shutdown_requests(&mut self) {
        let requests: Vec<(StreamId, ShutdownRequest)> = self
            .state
            .streams
            .iter_mut()
            .filter_map(|(id, stream)| stream.take_shutdown_request().map(|request| (*id, request)))
            .collect();

        for (stream_id, request) in requests {
            let Some(engine) = self.engine.as_mut() else {
                return;
            };
            let result = match request {
                ShutdownRequest::Read { error_code } => {
                    engine.shutdown_stream_read(stream_id, error_code)
                }
                ShutdownRequest::Write { error_code } => {
                    engine.shutdown_stream_write(stream_id, error_code)
                }
                ShutdownRequest::Both { error_code } => {
                    engine.shutdown_stream(stream_id, error_code)
                }
            };
            match result {
                Ok(()) => {
                    if let ShutdownRequest::Write { error_code }
                    | ShutdownRequest::Both { error_code } = request
                    {
                        if let Some(stream) = self.state.streams.get_mut(&stream_id) {
                            stream.output_mut().close(Some(error_code));
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(stream_id, error = %error, "stream shutdown failed");
                }
            }
        }
    }

    async fn on_engine_error(&mut self, error: EngineError) -> Result<Status, ConnectionError> {
        self.record_error(&error);
        self.disconnect().await;
        Ok(status_of(&error))
    }

    fn record_error(&mut self, error: &EngineError) {
        let close = match error {
            // Orderly teardown signals, not failures.
            EngineError::Draining
            | EngineError::Closing
            | EngineError::Retry
            | EngineError::DropConnection
            | EngineError::VersionNegotiation => return,
            // Stream-level sentinels never reach this path, but they are
            // not connection errors either.
            EngineError::StreamShutWrite
            | EngineError::StreamDataBlocked
            | EngineError::NoMoreStreams => return,
            EngineError::Crypto => {
                let alert = self
                    .engine
                    .as_ref()
                    .and_then(|engine| engine.tls_alert())
                    .unwrap_or(0);
                CloseError::TlsAlert(alert)
            }
            EngineError::Transport(code) => CloseError::Transport(*code),
            // The trampoline recorded the underlying fault already.
            EngineError::CallbackFailure => self
                .state
                .last_error
                .unwrap_or(CloseError::Transport(INTERNAL_ERROR)),
            EngineError::NoMemory => CloseError::Transport(INTERNAL_ERROR),
        };
        if self.state.last_error.is_none() {
            tracing::warn!(role = ?self.state.role, error = %error, "connection error");
            self.state.last_error = Some(close);
        }
    }

    fn terminal_status(&self) -> Status {
        match self.phase {
            Phase::Draining | Phase::Closed => Status::Draining,
            _ => Status::Closing,
        }
    }

    fn advance_phase(&mut self, next: Phase) {
        if next > self.phase {
            tracing::debug!(from = ?self.phase, to = ?next, "connection phase");
            self.phase = next;
        }
    }

    fn arm_drain(&mut self, now: Timestamp) {
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(now + self.close_duration());
        }
    }
}

async fn send_datagram(data: &[u8], write: &StreamWrite<Path>) -> Result<(), ConnectionError> {
    let Some(path) = write.path.as_ref() else {
        return Ok(());
    };
    path.socket
        .send_packet(data, path.remote, write.ecn, None)
        .await?;
    Ok(())
}

fn status_of(error: &EngineError) -> Status {
    match error {
        EngineError::Draining => Status::Draining,
        EngineError::Closing => Status::Closing,
        EngineError::Retry => Status::Retry,
        EngineError::DropConnection => Status::Drop,
        _ => Status::Closing,
    }
}
