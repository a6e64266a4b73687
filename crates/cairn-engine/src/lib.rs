//! Interface to the external QUIC packet engine.
//!
//! The engine owns the wire format, loss detection, congestion control and
//! the TLS record machinery. The orchestration layer above drives it
//! through [`Engine`] and reacts to its callbacks through
//! [`ConnectionEvents`].
//!
//! Callbacks are delivered synchronously while the engine is borrowed
//! mutably (`read_packet` / `handle_expiry` take `&mut dyn
//! ConnectionEvents`), so an events implementation cannot re-enter the
//! engine or perform I/O — any follow-up work has to be deferred until the
//! engine call returns. The one documented reentrant helper is
//! [`CryptoHelper`], which is stateless and shared separately.
//!
//! Everything here is generic over the path type `P`: the engine carries
//! the caller's path (addresses plus socket handle) through each read and
//! hands it back with every produced datagram, exactly like the C API's
//! `path.user_data` pointer, without ever inspecting the socket itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use cairn_core::{Configuration, ConnectionId, Ecn, Timestamp};

pub mod testing;
pub mod tls;

use tls::{ClientContext, ServerContext, TlsSession};

/// 62-bit QUIC stream identifier. `-1` ("no stream") is expressed as
/// `None` at the API boundary instead.
pub type StreamId = i64;

/// Stateless reset token derived for each locally issued connection ID.
pub type ResetToken = [u8; 16];

/// Addresses the engine needs from a path; the rest of the path rides
/// along opaquely.
pub trait NetworkPath: Clone + Send + Sync + 'static {
    fn local(&self) -> SocketAddr;
    fn remote(&self) -> SocketAddr;
}

/// Per-packet metadata crossing the engine boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInfo {
    pub ecn: Ecn,
}

/// Engine error codes. The transport inspects only these sentinels; any
/// other engine-defined code travels as `Transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("connection is in the draining period")]
    Draining,
    #[error("connection is in the closing period")]
    Closing,
    #[error("stateless retry required")]
    Retry,
    #[error("connection must be dropped")]
    DropConnection,
    #[error("version negotiation required")]
    VersionNegotiation,
    #[error("stream is shut for writing")]
    StreamShutWrite,
    #[error("stream is blocked by flow control")]
    StreamDataBlocked,
    #[error("no more streams may be opened")]
    NoMoreStreams,
    #[error("TLS failure")]
    Crypto,
    #[error("engine out of memory")]
    NoMemory,
    #[error("engine callback failed")]
    CallbackFailure,
    #[error("transport error {0}")]
    Transport(i64),
}

/// The error a connection closes with, as recorded in its last-error slot
/// and encoded into the CONNECTION_CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseError {
    /// Transport-level error code (engine liberror or wire code).
    Transport(i64),
    /// TLS alert raised by the crypto layer.
    TlsAlert(u8),
}

impl Default for CloseError {
    fn default() -> Self {
        // NO_ERROR: a clean local close.
        CloseError::Transport(0)
    }
}

/// Returned by a callback that failed; the engine translates it into its
/// `CallbackFailure` sentinel rather than unwinding.
#[derive(Debug, Clone, Copy, Error)]
#[error("connection callback failed")]
pub struct CallbackFailure;

pub type CallbackResult = Result<(), CallbackFailure>;

/// The callback fan-in a connection must service.
///
/// Invoked synchronously from inside `read_packet` / `handle_expiry`, in
/// the order the engine emits them. Implementations must not block and
/// must convert internal failures into [`CallbackFailure`] instead of
/// panicking through the engine.
pub trait ConnectionEvents {
    fn handshake_completed(&mut self) -> CallbackResult;

    /// The peer raised the number of bidirectional streams we may open.
    fn extend_max_local_bidi_streams(&mut self, max_streams: u64) -> CallbackResult;
    /// The peer raised the number of unidirectional streams we may open.
    fn extend_max_local_uni_streams(&mut self, max_streams: u64) -> CallbackResult;

    fn stream_open(&mut self, stream_id: StreamId) -> CallbackResult;
    fn stream_close(&mut self, stream_id: StreamId, error_code: u64) -> CallbackResult;
    fn stream_reset(&mut self, stream_id: StreamId, final_size: u64, error_code: u64)
        -> CallbackResult;
    fn stream_stop_sending(&mut self, stream_id: StreamId, error_code: u64) -> CallbackResult;

    /// The peer extended a stream's flow-control window.
    fn extend_max_stream_data(&mut self, stream_id: StreamId, max_data: u64) -> CallbackResult;

    /// In-order, reassembled stream bytes. `fin` marks the final byte.
    fn receive_stream_data(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> CallbackResult;

    /// The peer acknowledged `length` bytes starting at `offset`.
    fn acked_stream_data_offset(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        length: u64,
    ) -> CallbackResult;

    /// Produce a fresh connection ID of `length` bytes and its stateless
    /// reset token. Must draw from secure randomness.
    fn new_connection_id(
        &mut self,
        length: usize,
    ) -> Result<(ConnectionId, ResetToken), CallbackFailure>;

    /// Fill `buffer` with non-secure randomness.
    fn random(&mut self, buffer: &mut [u8]);
}

/// Outcome of a stream or connection-close write.
#[derive(Debug)]
pub struct StreamWrite<P> {
    /// Bytes of datagram placed in the output buffer; 0 when the engine
    /// produced nothing.
    pub packet: usize,
    /// Stream bytes the engine consumed from the supplied chunks.
    pub consumed: usize,
    /// Where to send the datagram. Present whenever `packet > 0`.
    pub path: Option<P>,
    /// ECN codepoint to mark the datagram with.
    pub ecn: Ecn,
}

impl<P> StreamWrite<P> {
    /// An outcome carrying no datagram and no progress.
    pub fn empty() -> Self {
        StreamWrite {
            packet: 0,
            consumed: 0,
            path: None,
            ecn: Ecn::default(),
        }
    }
}

/// A single QUIC connection inside the engine.
pub trait Engine<P: NetworkPath>: Send {
    /// Process one received datagram. Callbacks fire synchronously on
    /// `events` before this returns.
    fn read_packet(
        &mut self,
        path: &P,
        info: &PacketInfo,
        data: &[u8],
        now: Timestamp,
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError>;

    /// Produce at most one datagram. With `stream: None` only control and
    /// acknowledgement frames are written; with a stream, bytes are pulled
    /// from `chunks` (`fin` asserts FIN once every chunk byte is consumed).
    fn write_stream(
        &mut self,
        out: &mut [u8],
        stream: Option<StreamId>,
        chunks: &[&[u8]],
        fin: bool,
        now: Timestamp,
    ) -> Result<StreamWrite<P>, EngineError>;

    /// Produce the CONNECTION_CLOSE datagram for `error` and enter the
    /// closing period. Produces nothing if already closing or draining.
    fn write_connection_close(
        &mut self,
        out: &mut [u8],
        error: &CloseError,
        now: Timestamp,
    ) -> Result<StreamWrite<P>, EngineError>;

    /// Run timers that are due at `now`.
    fn handle_expiry(
        &mut self,
        now: Timestamp,
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError>;

    /// Absolute time of the next timer, if any is armed.
    fn expiry(&self) -> Option<Timestamp>;

    /// Current probe timeout.
    fn pto(&self) -> Duration;

    fn open_bidi_stream(&mut self) -> Result<StreamId, EngineError>;
    fn open_uni_stream(&mut self) -> Result<StreamId, EngineError>;

    fn shutdown_stream_read(&mut self, stream_id: StreamId, error_code: u64)
        -> Result<(), EngineError>;
    fn shutdown_stream_write(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), EngineError>;
    fn shutdown_stream(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), EngineError>;

    fn is_in_closing_period(&self) -> bool;
    fn is_in_draining_period(&self) -> bool;

    /// The destination CID the client chose for its first flight; servers
    /// keep it registered for routing until the connection dies.
    fn client_initial_dcid(&self) -> ConnectionId;

    /// Every source CID this connection currently answers to.
    fn source_cids(&self) -> Vec<ConnectionId>;

    /// The TLS alert behind the most recent `Crypto` error, if any.
    fn tls_alert(&self) -> Option<u8>;
}

/// Header fields of a packet that passed `accept`.
#[derive(Debug, Clone)]
pub struct InitialHeader {
    pub version: u32,
    /// The client-chosen destination CID.
    pub dcid: ConnectionId,
    /// The client's source CID.
    pub scid: ConnectionId,
}

/// Version and CIDs decoded from an arbitrary incoming datagram.
#[derive(Debug, Clone)]
pub struct VersionCid {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
}

/// Result of inspecting a datagram header before routing.
#[derive(Debug)]
pub enum DecodedHeader {
    /// A packet for a supported version; route by DCID.
    Route(VersionCid),
    /// Unsupported version; answer with a version negotiation datagram.
    NegotiateVersion(VersionCid),
}

/// Stateless, reentrant crypto helper shared by every connection of a
/// provider.
pub trait CryptoHelper: Send + Sync {
    /// Derive the stateless reset token for `cid` from the endpoint's
    /// static secret.
    fn stateless_reset_token(
        &self,
        static_secret: &[u8; 32],
        cid: &ConnectionId,
    ) -> Result<ResetToken, EngineError>;
}

/// Entry point to an engine implementation: connection constructors plus
/// the connectionless packet inspectors the dispatcher needs.
pub trait EngineProvider<P: NetworkPath>: Send + Sync {
    /// Create the engine side of a client connection.
    #[allow(clippy::too_many_arguments)]
    fn client_new(
        &self,
        dcid: ConnectionId,
        scid: ConnectionId,
        path: P,
        version: u32,
        configuration: &Configuration,
        tls: &ClientContext,
    ) -> Result<(Box<dyn Engine<P>>, Box<dyn TlsSession>), EngineError>;

    /// Create the engine side of a server connection for an accepted
    /// initial packet. `retry_scid` is set on stateless-retry flows.
    #[allow(clippy::too_many_arguments)]
    fn server_new(
        &self,
        peer_scid: ConnectionId,
        local_scid: ConnectionId,
        original_dcid: ConnectionId,
        retry_scid: Option<ConnectionId>,
        path: P,
        version: u32,
        configuration: &Configuration,
        tls: &ServerContext,
    ) -> Result<(Box<dyn Engine<P>>, Box<dyn TlsSession>), EngineError>;

    /// Decode the version and CIDs of an arbitrary datagram.
    fn decode_version_cid(
        &self,
        data: &[u8],
        default_scid_len: usize,
    ) -> Result<DecodedHeader, EngineError>;

    /// Validate a datagram as the first packet of a new connection.
    fn accept(&self, data: &[u8]) -> Result<InitialHeader, EngineError>;

    /// Write a version negotiation datagram answering `header` into `out`;
    /// returns its length. The datagram lists every supported version.
    fn write_version_negotiation(
        &self,
        out: &mut [u8],
        header: &VersionCid,
    ) -> Result<usize, EngineError>;

    fn supported_versions(&self) -> &[u32];

    fn crypto(&self) -> Arc<dyn CryptoHelper>;
}
