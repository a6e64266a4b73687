//! In-memory engine used by the integration tests.
//!
//! `LoopbackProvider` implements the full [`EngineProvider`] surface over a
//! miniature length-prefixed frame format so the orchestration layer can be
//! driven end-to-end across real UDP sockets without a QUIC stack. It is
//! not QUIC: there is no encryption, no loss recovery (datagrams are
//! assumed in-order, which holds on loopback), and flow control is a
//! single per-stream window. Callbacks fire in emission order exactly as a
//! real engine's would.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};

use cairn_core::{Configuration, ConnectionId, Ecn, Timestamp, DEFAULT_CID_LEN};

use crate::tls::{ClientContext, ServerContext, TlsSession};
use crate::{
    CallbackFailure, CloseError, ConnectionEvents, CryptoHelper, DecodedHeader, Engine,
    EngineError, EngineProvider, InitialHeader, NetworkPath, PacketInfo, ResetToken, StreamId,
    StreamWrite, VersionCid,
};

/// The one version this engine speaks.
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Fixed probe timeout; close/drain periods are multiples of this.
pub const PTO: Duration = Duration::from_millis(25);

/// Engine code reported when the idle timer fires.
pub const ERR_IDLE_TIMEOUT: i64 = -30;

const ERR_DECODE: i64 = -31;
const ERR_STREAM_NOT_FOUND: i64 = -32;

// Generous for loopback; a real engine would size this to the path MTU.
const MAX_PACKET: usize = 16 * 1024;

// Frame tags.
const FRAME_INIT: u8 = 0x01;
const FRAME_ACCEPT: u8 = 0x02;
const FRAME_STREAM: u8 = 0x03;
const FRAME_ACK: u8 = 0x04;
const FRAME_MAX_STREAM_DATA: u8 = 0x05;
const FRAME_RESET: u8 = 0x06;
const FRAME_STOP: u8 = 0x07;
const FRAME_CLOSE: u8 = 0x08;

/// Extra source CIDs a server issues once the handshake completes.
const EXTRA_SERVER_CIDS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn bit(self) -> i64 {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }
}

fn is_uni(id: StreamId) -> bool {
    id & 0x2 != 0
}

fn initiated_by(id: StreamId) -> Side {
    if id & 0x1 == 0 {
        Side::Client
    } else {
        Side::Server
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

fn put_cid(out: &mut Vec<u8>, cid: &ConnectionId) {
    out.put_u8(cid.len() as u8);
    out.put_slice(cid.as_bytes());
}

fn get_cid(data: &mut &[u8]) -> Option<ConnectionId> {
    if data.remaining() < 1 {
        return None;
    }
    let len = data.get_u8() as usize;
    if len > cairn_core::MAX_CID_LEN || data.remaining() < len {
        return None;
    }
    let cid = ConnectionId::try_from(&data[..len]).ok()?;
    data.advance(len);
    Some(cid)
}

fn put_header(out: &mut Vec<u8>, version: u32, dcid: &ConnectionId, scid: &ConnectionId) {
    out.put_u32(version);
    put_cid(out, dcid);
    put_cid(out, scid);
}

fn get_header(data: &mut &[u8]) -> Option<VersionCid> {
    if data.remaining() < 4 {
        return None;
    }
    let version = data.get_u32();
    let dcid = get_cid(data)?;
    let scid = get_cid(data)?;
    Some(VersionCid {
        version,
        dcid,
        scid,
    })
}

#[derive(Debug, Clone)]
enum Frame {
    Init {
        stream_window: u64,
        max_bidi: u64,
        max_uni: u64,
    },
    Accept {
        stream_window: u64,
        max_bidi: u64,
        max_uni: u64,
    },
    Stream {
        id: StreamId,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    Ack {
        id: StreamId,
        upto: u64,
    },
    MaxStreamData {
        id: StreamId,
        max: u64,
    },
    Reset {
        id: StreamId,
        final_size: u64,
        error_code: u64,
    },
    Stop {
        id: StreamId,
        error_code: u64,
    },
    Close {
        error: CloseError,
    },
}

impl Frame {
    fn encoded_len(&self) -> usize {
        match self {
            Frame::Init { .. } | Frame::Accept { .. } => 1 + 24,
            Frame::Stream { data, .. } => 1 + 8 + 8 + 1 + 4 + data.len(),
            Frame::Ack { .. } | Frame::MaxStreamData { .. } => 1 + 16,
            Frame::Reset { .. } => 1 + 24,
            Frame::Stop { .. } => 1 + 16,
            Frame::Close { .. } => 1 + 9,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Init {
                stream_window,
                max_bidi,
                max_uni,
            } => {
                out.put_u8(FRAME_INIT);
                out.put_u64(*stream_window);
                out.put_u64(*max_bidi);
                out.put_u64(*max_uni);
            }
            Frame::Accept {
                stream_window,
                max_bidi,
                max_uni,
            } => {
                out.put_u8(FRAME_ACCEPT);
                out.put_u64(*stream_window);
                out.put_u64(*max_bidi);
                out.put_u64(*max_uni);
            }
            Frame::Stream {
                id,
                offset,
                fin,
                data,
            } => {
                out.put_u8(FRAME_STREAM);
                out.put_i64(*id);
                out.put_u64(*offset);
                out.put_u8(u8::from(*fin));
                out.put_u32(data.len() as u32);
                out.put_slice(data);
            }
            Frame::Ack { id, upto } => {
                out.put_u8(FRAME_ACK);
                out.put_i64(*id);
                out.put_u64(*upto);
            }
            Frame::MaxStreamData { id, max } => {
                out.put_u8(FRAME_MAX_STREAM_DATA);
                out.put_i64(*id);
                out.put_u64(*max);
            }
            Frame::Reset {
                id,
                final_size,
                error_code,
            } => {
                out.put_u8(FRAME_RESET);
                out.put_i64(*id);
                out.put_u64(*final_size);
                out.put_u64(*error_code);
            }
            Frame::Stop { id, error_code } => {
                out.put_u8(FRAME_STOP);
                out.put_i64(*id);
                out.put_u64(*error_code);
            }
            Frame::Close { error } => {
                out.put_u8(FRAME_CLOSE);
                match error {
                    CloseError::Transport(code) => {
                        out.put_u8(0);
                        out.put_u64(*code as u64);
                    }
                    CloseError::TlsAlert(alert) => {
                        out.put_u8(1);
                        out.put_u64(u64::from(*alert));
                    }
                }
            }
        }
    }

    fn decode(data: &mut &[u8]) -> Option<Frame> {
        if data.remaining() < 1 {
            return None;
        }
        let tag = data.get_u8();
        match tag {
            FRAME_INIT | FRAME_ACCEPT => {
                if data.remaining() < 24 {
                    return None;
                }
                let stream_window = data.get_u64();
                let max_bidi = data.get_u64();
                let max_uni = data.get_u64();
                Some(if tag == FRAME_INIT {
                    Frame::Init {
                        stream_window,
                        max_bidi,
                        max_uni,
                    }
                } else {
                    Frame::Accept {
                        stream_window,
                        max_bidi,
                        max_uni,
                    }
                })
            }
            FRAME_STREAM => {
                if data.remaining() < 21 {
                    return None;
                }
                let id = data.get_i64();
                let offset = data.get_u64();
                let fin = data.get_u8() != 0;
                let len = data.get_u32() as usize;
                if data.remaining() < len {
                    return None;
                }
                let payload = Bytes::copy_from_slice(&data[..len]);
                data.advance(len);
                Some(Frame::Stream {
                    id,
                    offset,
                    fin,
                    data: payload,
                })
            }
            FRAME_ACK => {
                if data.remaining() < 16 {
                    return None;
                }
                Some(Frame::Ack {
                    id: data.get_i64(),
                    upto: data.get_u64(),
                })
            }
            FRAME_MAX_STREAM_DATA => {
                if data.remaining() < 16 {
                    return None;
                }
                Some(Frame::MaxStreamData {
                    id: data.get_i64(),
                    max: data.get_u64(),
                })
            }
            FRAME_RESET => {
                if data.remaining() < 24 {
                    return None;
                }
                Some(Frame::Reset {
                    id: data.get_i64(),
                    final_size: data.get_u64(),
                    error_code: data.get_u64(),
                })
            }
            FRAME_STOP => {
                if data.remaining() < 16 {
                    return None;
                }
                Some(Frame::Stop {
                    id: data.get_i64(),
                    error_code: data.get_u64(),
                })
            }
            FRAME_CLOSE => {
                if data.remaining() < 9 {
                    return None;
                }
                let kind = data.get_u8();
                let value = data.get_u64();
                let error = if kind == 1 {
                    CloseError::TlsAlert(value as u8)
                } else {
                    CloseError::Transport(value as i64)
                };
                Some(Frame::Close { error })
            }
            _ => None,
        }
    }
}

/// Encode a bare initial datagram with an arbitrary version. Used by tests
/// that need to poke a dispatcher with unsupported versions.
pub fn encode_initial_datagram(version: u32, dcid: &ConnectionId, scid: &ConnectionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    put_header(&mut out, version, dcid, scid);
    Frame::Init {
        stream_window: 65536,
        max_bidi: 3,
        max_uni: 3,
    }
    .encode(&mut out);
    out
}

/// Decode a version negotiation datagram: returns the echoed CIDs and the
/// advertised versions.
pub fn decode_version_negotiation(data: &[u8]) -> Option<(VersionCid, Vec<u32>)> {
    let mut cursor = data;
    let header = get_header(&mut cursor)?;
    if header.version != 0 {
        return None;
    }
    if cursor.remaining() < 1 {
        return None;
    }
    let count = cursor.get_u8() as usize;
    if cursor.remaining() < count * 4 {
        return None;
    }
    let versions = (0..count).map(|_| cursor.get_u32()).collect();
    Some((header, versions))
}

// ── Crypto helper ─────────────────────────────────────────────────────────────

/// Token derivation for tests: a keyed mix of the secret and CID bytes.
/// Deterministic, so the same secret+CID always yields the same token.
#[derive(Debug, Default)]
pub struct LoopbackCrypto;

impl CryptoHelper for LoopbackCrypto {
    fn stateless_reset_token(
        &self,
        static_secret: &[u8; 32],
        cid: &ConnectionId,
    ) -> Result<ResetToken, EngineError> {
        let mut token = [0u8; 16];
        for (i, slot) in token.iter_mut().enumerate() {
            let mut mixed = static_secret[i] ^ static_secret[i + 16];
            for (j, byte) in cid.as_bytes().iter().enumerate() {
                mixed = mixed.rotate_left(3) ^ byte.wrapping_add(j as u8);
            }
            *slot = mixed.wrapping_add(i as u8);
        }
        Ok(token)
    }
}

// ── TLS session ───────────────────────────────────────────────────────────────

struct LoopbackSession {
    alpn: Option<Vec<u8>>,
    server_name: Option<String>,
}

impl TlsSession for LoopbackSession {
    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    fn alert(&self) -> Option<u8> {
        None
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// Client: the INIT datagram has not been emitted yet.
    NeedsInit,
    /// Client: INIT sent, waiting for ACCEPT.
    InitSent,
    /// Server: waiting for the first INIT.
    AwaitingInit,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Closing,
    Draining,
}

#[derive(Debug, Default)]
struct StreamState {
    send_offset: u64,
    send_max: u64,
    acked: u64,
    fin_sent: bool,
    fin_offset: Option<u64>,
    write_shut: bool,
    recv_len: u64,
    remote_fin: bool,
}

impl StreamState {
    fn local_done(&self) -> bool {
        self.write_shut || (self.fin_sent && Some(self.acked) >= self.fin_offset)
    }
}

pub struct LoopbackEngine<P: NetworkPath> {
    side: Side,
    version: u32,
    path: P,

    local_cids: Vec<ConnectionId>,
    remote_cid: ConnectionId,
    original_dcid: ConnectionId,

    handshake: Handshake,
    phase: Phase,
    tls_alert: Option<u8>,

    // Credit we grant the peer per incoming stream.
    local_window: u64,
    local_max_bidi: u64,
    local_max_uni: u64,

    // Grants learned from the peer.
    peer_window: u64,
    peer_max_bidi: u64,
    peer_max_uni: u64,

    local_bidi_opened: u64,
    local_uni_opened: u64,

    streams: HashMap<StreamId, StreamState>,
    control: VecDeque<Frame>,

    idle_timeout: Duration,
    idle_deadline: Timestamp,
}

impl<P: NetworkPath> LoopbackEngine<P> {
    fn new(
        side: Side,
        version: u32,
        path: P,
        scid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        configuration: &Configuration,
    ) -> Self {
        let params = configuration.transport_parameters();
        LoopbackEngine {
            side,
            version,
            path,
            local_cids: vec![scid],
            remote_cid,
            original_dcid,
            handshake: match side {
                Side::Client => Handshake::NeedsInit,
                Side::Server => Handshake::AwaitingInit,
            },
            phase: Phase::Active,
            tls_alert: None,
            local_window: params.initial_max_stream_data_bidi_remote,
            local_max_bidi: params.initial_max_streams_bidi,
            local_max_uni: params.initial_max_streams_uni,
            peer_window: 0,
            peer_max_bidi: 0,
            peer_max_uni: 0,
            local_bidi_opened: 0,
            local_uni_opened: 0,
            streams: HashMap::new(),
            control: VecDeque::new(),
            idle_timeout: params.max_idle_timeout,
            idle_deadline: Timestamp::now() + params.max_idle_timeout,
        }
    }

    fn touch(&mut self, now: Timestamp) {
        self.idle_deadline = now + self.idle_timeout;
    }

    fn header(&self, out: &mut Vec<u8>) {
        put_header(out, self.version, &self.remote_cid, &self.local_cids[0]);
    }

    fn datagram(&self, frames: impl IntoIterator<Item = Frame>) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_PACKET);
        self.header(&mut out);
        for frame in frames {
            frame.encode(&mut out);
        }
        out
    }

    fn outcome(&self, out: &mut [u8], datagram: Vec<u8>, consumed: usize) -> StreamWrite<P> {
        out[..datagram.len()].copy_from_slice(&datagram);
        StreamWrite {
            packet: datagram.len(),
            consumed,
            path: Some(self.path.clone()),
            ecn: Ecn::Ect0,
        }
    }

    fn initiated_locally(&self, id: StreamId) -> bool {
        initiated_by(id) == self.side
    }

    /// Fire `stream_close` once both halves of the stream are finished.
    fn maybe_close(
        &mut self,
        id: StreamId,
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError> {
        let done = {
            let Some(stream) = self.streams.get(&id) else {
                return Ok(());
            };
            let uni = is_uni(id);
            let local_half = !uni || initiated_by(id) == self.side;
            let remote_half = !uni || initiated_by(id) != self.side;

            let local_done = !local_half || stream.local_done();
            let remote_done = !remote_half || stream.remote_fin;
            local_done && remote_done
        };
        if done {
            self.streams.remove(&id);
            cb(events.stream_close(id, 0))?;
        }
        Ok(())
    }

    fn complete_handshake(
        &mut self,
        peer: (u64, u64, u64),
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError> {
        let (window, max_bidi, max_uni) = peer;
        self.peer_window = window;
        self.peer_max_bidi = max_bidi;
        self.peer_max_uni = max_uni;
        for stream in self.streams.values_mut() {
            if stream.send_max < window {
                stream.send_max = window;
            }
        }
        self.handshake = Handshake::Complete;

        // Servers issue extra source CIDs for future routing.
        if self.side == Side::Server {
            for _ in 0..EXTRA_SERVER_CIDS {
                let (cid, _token) = events
                    .new_connection_id(DEFAULT_CID_LEN)
                    .map_err(|CallbackFailure| EngineError::CallbackFailure)?;
                self.local_cids.push(cid);
            }
        }

        let mut nonce = [0u8; 4];
        events.random(&mut nonce);

        cb(events.handshake_completed())?;
        cb(events.extend_max_local_bidi_streams(max_bidi))?;
        cb(events.extend_max_local_uni_streams(max_uni))?;
        Ok(())
    }

    fn handle_frame(
        &mut self,
        header: &VersionCid,
        frame: Frame,
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError> {
        match frame {
            Frame::Init {
                stream_window,
                max_bidi,
                max_uni,
            } => {
                if self.side != Side::Server || self.handshake == Handshake::Complete {
                    return Ok(());
                }
                self.remote_cid = header.scid;
                self.complete_handshake((stream_window, max_bidi, max_uni), events)?;
                self.control.push_back(Frame::Accept {
                    stream_window: self.local_window,
                    max_bidi: self.local_max_bidi,
                    max_uni: self.local_max_uni,
                });
            }
            Frame::Accept {
                stream_window,
                max_bidi,
                max_uni,
            } => {
                if self.side != Side::Client || self.handshake == Handshake::Complete {
                    return Ok(());
                }
                self.remote_cid = header.scid;
                self.complete_handshake((stream_window, max_bidi, max_uni), events)?;
            }
            Frame::Stream {
                id,
                offset,
                fin,
                data,
            } => {
                if !self.streams.contains_key(&id) {
                    if self.initiated_locally(id) {
                        // Data for a retired local stream; drop.
                        return Ok(());
                    }
                    self.streams.insert(
                        id,
                        StreamState {
                            send_max: self.peer_window,
                            ..StreamState::default()
                        },
                    );
                    cb(events.stream_open(id))?;
                }
                let stream = self.streams.get_mut(&id).expect("stream just ensured");
                if offset != stream.recv_len {
                    // Out of order or duplicate; loopback delivery makes
                    // this a stale retransmit, so drop it.
                    return Ok(());
                }
                stream.recv_len += data.len() as u64;
                if fin {
                    stream.remote_fin = true;
                }
                let recv_len = stream.recv_len;
                cb(events.receive_stream_data(id, offset, &data, fin))?;
                self.control.push_back(Frame::Ack { id, upto: recv_len });
                if !fin {
                    self.control.push_back(Frame::MaxStreamData {
                        id,
                        max: recv_len + self.local_window,
                    });
                }
                self.maybe_close(id, events)?;
            }
            Frame::Ack { id, upto } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                if upto > stream.acked {
                    let offset = stream.acked;
                    let length = upto - offset;
                    stream.acked = upto;
                    cb(events.acked_stream_data_offset(id, offset, length))?;
                    self.maybe_close(id, events)?;
                }
            }
            Frame::MaxStreamData { id, max } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                if max > stream.send_max {
                    stream.send_max = max;
                    cb(events.extend_max_stream_data(id, max))?;
                }
            }
            Frame::Reset {
                id,
                final_size,
                error_code,
            } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                stream.remote_fin = true;
                cb(events.stream_reset(id, final_size, error_code))?;
                self.maybe_close(id, events)?;
            }
            Frame::Stop { id, error_code } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                stream.write_shut = true;
                let final_size = stream.send_offset;
                self.control.push_back(Frame::Reset {
                    id,
                    final_size,
                    error_code,
                });
                cb(events.stream_stop_sending(id, error_code))?;
                self.maybe_close(id, events)?;
            }
            Frame::Close { .. } => {
                self.phase = Phase::Draining;
                return Err(EngineError::Draining);
            }
        }
        Ok(())
    }
}

fn cb(result: crate::CallbackResult) -> Result<(), EngineError> {
    result.map_err(|CallbackFailure| EngineError::CallbackFailure)
}

impl<P: NetworkPath> Engine<P> for LoopbackEngine<P> {
    fn read_packet(
        &mut self,
        path: &P,
        _info: &PacketInfo,
        data: &[u8],
        now: Timestamp,
        events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError> {
        match self.phase {
            Phase::Draining => return Err(EngineError::Draining),
            Phase::Closing => return Err(EngineError::Closing),
            Phase::Active => {}
        }

        let mut cursor = data;
        let header = get_header(&mut cursor).ok_or(EngineError::Transport(ERR_DECODE))?;
        if header.version != self.version {
            // Not for this connection (e.g. a version negotiation reply
            // we do not model); ignore.
            return Ok(());
        }

        self.path = path.clone();
        self.touch(now);

        while cursor.has_remaining() {
            let Some(frame) = Frame::decode(&mut cursor) else {
                return Err(EngineError::Transport(ERR_DECODE));
            };
            self.handle_frame(&header, frame, events)?;
        }
        Ok(())
    }

    fn write_stream(
        &mut self,
        out: &mut [u8],
        stream: Option<StreamId>,
        chunks: &[&[u8]],
        fin: bool,
        now: Timestamp,
    ) -> Result<StreamWrite<P>, EngineError> {
        match self.phase {
            Phase::Draining => return Err(EngineError::Draining),
            Phase::Closing => return Err(EngineError::Closing),
            Phase::Active => {}
        }

        let Some(id) = stream else {
            // Control pass: flush the client's first flight, then any
            // queued control frames.
            if self.handshake == Handshake::NeedsInit {
                self.handshake = Handshake::InitSent;
                let datagram = self.datagram([Frame::Init {
                    stream_window: self.local_window,
                    max_bidi: self.local_max_bidi,
                    max_uni: self.local_max_uni,
                }]);
                self.touch(now);
                return Ok(self.outcome(out, datagram, 0));
            }
            if self.control.is_empty() {
                return Ok(StreamWrite::empty());
            }
            let mut frames = Vec::new();
            let mut used = 50; // worst-case header
            loop {
                let Some(next_len) = self.control.front().map(Frame::encoded_len) else {
                    break;
                };
                if used + next_len > MAX_PACKET && !frames.is_empty() {
                    break;
                }
                used += next_len;
                frames.push(self.control.pop_front().expect("front just checked"));
            }
            let datagram = self.datagram(frames);
            self.touch(now);
            return Ok(self.outcome(out, datagram, 0));
        };

        if self.handshake != Handshake::Complete {
            return Err(EngineError::StreamDataBlocked);
        }
        let stream_state = self
            .streams
            .get_mut(&id)
            .ok_or(EngineError::Transport(ERR_STREAM_NOT_FOUND))?;
        if stream_state.write_shut {
            return Err(EngineError::StreamShutWrite);
        }

        let pending: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        let window_left = stream_state.send_max.saturating_sub(stream_state.send_offset) as usize;
        let space = MAX_PACKET - 50 - 30;
        let take = pending.min(window_left).min(space);

        if pending > 0 && take == 0 {
            return Err(EngineError::StreamDataBlocked);
        }

        let fin_now = fin && take == pending && !stream_state.fin_sent;
        if take == 0 && !fin_now {
            return Ok(StreamWrite::empty());
        }

        let mut payload = Vec::with_capacity(take);
        for chunk in chunks {
            if payload.len() == take {
                break;
            }
            let want = (take - payload.len()).min(chunk.len());
            payload.extend_from_slice(&chunk[..want]);
        }

        let offset = stream_state.send_offset;
        stream_state.send_offset += take as u64;
        if fin_now {
            stream_state.fin_sent = true;
            stream_state.fin_offset = Some(stream_state.send_offset);
        }

        let datagram = self.datagram([Frame::Stream {
            id,
            offset,
            fin: fin_now,
            data: Bytes::from(payload),
        }]);
        self.touch(now);
        Ok(self.outcome(out, datagram, take))
    }

    fn write_connection_close(
        &mut self,
        out: &mut [u8],
        error: &CloseError,
        now: Timestamp,
    ) -> Result<StreamWrite<P>, EngineError> {
        if self.phase != Phase::Active {
            return Ok(StreamWrite::empty());
        }
        self.phase = Phase::Closing;
        let datagram = self.datagram([Frame::Close { error: *error }]);
        self.touch(now);
        Ok(self.outcome(out, datagram, 0))
    }

    fn handle_expiry(
        &mut self,
        now: Timestamp,
        _events: &mut dyn ConnectionEvents,
    ) -> Result<(), EngineError> {
        if self.phase != Phase::Active {
            return Ok(());
        }
        if now >= self.idle_deadline {
            // Idle close is silent: drain without emitting a packet.
            self.phase = Phase::Draining;
            return Err(EngineError::Transport(ERR_IDLE_TIMEOUT));
        }
        Ok(())
    }

    fn expiry(&self) -> Option<Timestamp> {
        match self.phase {
            Phase::Active => Some(self.idle_deadline),
            _ => None,
        }
    }

    fn pto(&self) -> Duration {
        PTO
    }

    fn open_bidi_stream(&mut self) -> Result<StreamId, EngineError> {
        if self.local_bidi_opened >= self.peer_max_bidi {
            return Err(EngineError::NoMoreStreams);
        }
        let id = self.local_bidi_opened as i64 * 4 + self.side.bit();
        self.local_bidi_opened += 1;
        self.streams.insert(
            id,
            StreamState {
                send_max: self.peer_window,
                ..StreamState::default()
            },
        );
        Ok(id)
    }

    fn open_uni_stream(&mut self) -> Result<StreamId, EngineError> {
        if self.local_uni_opened >= self.peer_max_uni {
            return Err(EngineError::NoMoreStreams);
        }
        let id = self.local_uni_opened as i64 * 4 + 2 + self.side.bit();
        self.local_uni_opened += 1;
        self.streams.insert(
            id,
            StreamState {
                send_max: self.peer_window,
                ..StreamState::default()
            },
        );
        Ok(id)
    }

    fn shutdown_stream_read(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), EngineError> {
        if !self.streams.contains_key(&stream_id) {
            return Err(EngineError::Transport(ERR_STREAM_NOT_FOUND));
        }
        self.control.push_back(Frame::Stop {
            id: stream_id,
            error_code,
        });
        Ok(())
    }

    fn shutdown_stream_write(
        &mut self,
        stream_id: StreamId,
        error_code: u64,
    ) -> Result<(), EngineError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(EngineError::Transport(ERR_STREAM_NOT_FOUND))?;
        if stream.write_shut {
            return Ok(());
        }
        stream.write_shut = true;
        let final_size = stream.send_offset;
        self.control.push_back(Frame::Reset {
            id: stream_id,
            final_size,
            error_code,
        });
        Ok(())
    }

    fn shutdown_stream(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), EngineError> {
        self.shutdown_stream_write(stream_id, error_code)?;
        self.shutdown_stream_read(stream_id, error_code)
    }

    fn is_in_closing_period(&self) -> bool {
        self.phase == Phase::Closing
    }

    fn is_in_draining_period(&self) -> bool {
        self.phase == Phase::Draining
    }

    fn client_initial_dcid(&self) -> ConnectionId {
        self.original_dcid
    }

    fn source_cids(&self) -> Vec<ConnectionId> {
        self.local_cids.clone()
    }

    fn tls_alert(&self) -> Option<u8> {
        self.tls_alert
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct LoopbackProvider {
    versions: Vec<u32>,
    crypto: Arc<LoopbackCrypto>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        LoopbackProvider {
            versions: vec![PROTOCOL_VERSION],
            crypto: Arc::new(LoopbackCrypto),
        }
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: NetworkPath> EngineProvider<P> for LoopbackProvider {
    fn client_new(
        &self,
        dcid: ConnectionId,
        scid: ConnectionId,
        path: P,
        version: u32,
        configuration: &Configuration,
        tls: &ClientContext,
    ) -> Result<(Box<dyn Engine<P>>, Box<dyn TlsSession>), EngineError> {
        if !self.versions.contains(&version) {
            return Err(EngineError::VersionNegotiation);
        }
        let engine = LoopbackEngine::new(
            Side::Client,
            version,
            path,
            scid,
            dcid,
            dcid,
            configuration,
        );
        let session = LoopbackSession {
            alpn: tls.alpn_protocols().first().cloned(),
            server_name: Some(tls.server_name().to_string()),
        };
        Ok((Box::new(engine), Box::new(session)))
    }

    fn server_new(
        &self,
        peer_scid: ConnectionId,
        local_scid: ConnectionId,
        original_dcid: ConnectionId,
        _retry_scid: Option<ConnectionId>,
        path: P,
        version: u32,
        configuration: &Configuration,
        tls: &ServerContext,
    ) -> Result<(Box<dyn Engine<P>>, Box<dyn TlsSession>), EngineError> {
        if !self.versions.contains(&version) {
            return Err(EngineError::VersionNegotiation);
        }
        let engine = LoopbackEngine::new(
            Side::Server,
            version,
            path,
            local_scid,
            peer_scid,
            original_dcid,
            configuration,
        );
        let session = LoopbackSession {
            alpn: tls.alpn_protocols().first().cloned(),
            server_name: None,
        };
        Ok((Box::new(engine), Box::new(session)))
    }

    fn decode_version_cid(
        &self,
        data: &[u8],
        _default_scid_len: usize,
    ) -> Result<DecodedHeader, EngineError> {
        let mut cursor = data;
        let header = get_header(&mut cursor).ok_or(EngineError::Transport(ERR_DECODE))?;
        if self.versions.contains(&header.version) {
            Ok(DecodedHeader::Route(header))
        } else {
            Ok(DecodedHeader::NegotiateVersion(header))
        }
    }

    fn accept(&self, data: &[u8]) -> Result<InitialHeader, EngineError> {
        let mut cursor = data;
        let header = get_header(&mut cursor).ok_or(EngineError::Transport(ERR_DECODE))?;
        if !self.versions.contains(&header.version) {
            return Err(EngineError::VersionNegotiation);
        }
        match Frame::decode(&mut cursor) {
            Some(Frame::Init { .. }) => Ok(InitialHeader {
                version: header.version,
                dcid: header.dcid,
                scid: header.scid,
            }),
            _ => Err(EngineError::DropConnection),
        }
    }

    fn write_version_negotiation(
        &self,
        out: &mut [u8],
        header: &VersionCid,
    ) -> Result<usize, EngineError> {
        let mut datagram = Vec::with_capacity(64);
        // Version 0 marks negotiation; CIDs are echoed swapped.
        put_header(&mut datagram, 0, &header.scid, &header.dcid);
        datagram.put_u8(self.versions.len() as u8);
        for version in &self.versions {
            datagram.put_u32(*version);
        }
        if datagram.len() > out.len() {
            return Err(EngineError::NoMemory);
        }
        out[..datagram.len()].copy_from_slice(&datagram);
        Ok(datagram.len())
    }

    fn supported_versions(&self) -> &[u32] {
        &self.versions
    }

    fn crypto(&self) -> Arc<dyn CryptoHelper> {
        self.crypto.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::SecureRandom;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from(bytes).unwrap()
    }

    #[test]
    fn frame_round_trip() {
        let frames = vec![
            Frame::Stream {
                id: 4,
                offset: 1024,
                fin: true,
                data: Bytes::from_static(b"payload"),
            },
            Frame::Ack { id: 4, upto: 1031 },
            Frame::MaxStreamData { id: 4, max: 65536 },
            Frame::Close {
                error: CloseError::TlsAlert(80),
            },
        ];
        let mut out = Vec::new();
        for frame in &frames {
            frame.encode(&mut out);
        }
        let mut cursor = &out[..];
        for expected in &frames {
            let decoded = Frame::decode(&mut cursor).unwrap();
            assert_eq!(format!("{decoded:?}"), format!("{expected:?}"));
        }
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn version_negotiation_round_trip() {
        let provider = LoopbackProvider::new();
        let header = VersionCid {
            version: 0xdead_beef,
            dcid: cid(&[1, 2, 3, 4]),
            scid: cid(&[5, 6, 7, 8]),
        };
        let mut out = [0u8; 128];
        let len =
            EngineProvider::<TestPath>::write_version_negotiation(&provider, &mut out, &header)
                .unwrap();
        let (echoed, versions) = decode_version_negotiation(&out[..len]).unwrap();
        assert_eq!(echoed.dcid, header.scid);
        assert_eq!(echoed.scid, header.dcid);
        assert_eq!(versions, vec![PROTOCOL_VERSION]);
    }

    #[test]
    fn unsupported_version_is_flagged() {
        let provider = LoopbackProvider::new();
        let datagram = encode_initial_datagram(0x1a2a_3a4a, &cid(&[1]), &cid(&[2]));
        let decoded =
            EngineProvider::<TestPath>::decode_version_cid(&provider, &datagram, 8).unwrap();
        assert!(matches!(decoded, DecodedHeader::NegotiateVersion(_)));
    }

    #[test]
    fn reset_tokens_are_deterministic() {
        let crypto = LoopbackCrypto;
        let secret = [7u8; 32];
        let a = crypto
            .stateless_reset_token(&secret, &cid(&[1, 2, 3]))
            .unwrap();
        let b = crypto
            .stateless_reset_token(&secret, &cid(&[1, 2, 3]))
            .unwrap();
        let c = crypto
            .stateless_reset_token(&secret, &cid(&[1, 2, 4]))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[derive(Clone)]
    struct TestPath;

    impl NetworkPath for TestPath {
        fn local(&self) -> std::net::SocketAddr {
            "127.0.0.1:1".parse().unwrap()
        }

        fn remote(&self) -> std::net::SocketAddr {
            "127.0.0.1:2".parse().unwrap()
        }
    }

    struct NullEvents;

    impl ConnectionEvents for NullEvents {
        fn handshake_completed(&mut self) -> crate::CallbackResult {
            Ok(())
        }
        fn extend_max_local_bidi_streams(&mut self, _max: u64) -> crate::CallbackResult {
            Ok(())
        }
        fn extend_max_local_uni_streams(&mut self, _max: u64) -> crate::CallbackResult {
            Ok(())
        }
        fn stream_open(&mut self, _id: StreamId) -> crate::CallbackResult {
            Ok(())
        }
        fn stream_close(&mut self, _id: StreamId, _error_code: u64) -> crate::CallbackResult {
            Ok(())
        }
        fn stream_reset(
            &mut self,
            _id: StreamId,
            _final_size: u64,
            _error_code: u64,
        ) -> crate::CallbackResult {
            Ok(())
        }
        fn stream_stop_sending(&mut self, _id: StreamId, _error_code: u64) -> crate::CallbackResult {
            Ok(())
        }
        fn extend_max_stream_data(&mut self, _id: StreamId, _max: u64) -> crate::CallbackResult {
            Ok(())
        }
        fn receive_stream_data(
            &mut self,
            _id: StreamId,
            _offset: u64,
            _data: &[u8],
            _fin: bool,
        ) -> crate::CallbackResult {
            Ok(())
        }
        fn acked_stream_data_offset(
            &mut self,
            _id: StreamId,
            _offset: u64,
            _length: u64,
        ) -> crate::CallbackResult {
            Ok(())
        }
        fn new_connection_id(
            &mut self,
            length: usize,
        ) -> Result<(ConnectionId, ResetToken), CallbackFailure> {
            let mut random = SecureRandom::new();
            let cid = ConnectionId::random(length, &mut random).map_err(|_| CallbackFailure)?;
            Ok((cid, [0u8; 16]))
        }
        fn random(&mut self, buffer: &mut [u8]) {
            buffer.fill(0xaa);
        }
    }

    #[test]
    fn client_first_flight_is_init() {
        let provider = LoopbackProvider::new();
        let configuration = Configuration::new();
        let tls = ClientContext::new("localhost");
        let (mut engine, _session) = EngineProvider::<TestPath>::client_new(
            &provider,
            cid(&[9, 9]),
            cid(&[1, 1]),
            TestPath,
            PROTOCOL_VERSION,
            &configuration,
            &tls,
        )
        .unwrap();

        let mut out = [0u8; MAX_PACKET];
        let write = engine
            .write_stream(&mut out, None, &[], false, Timestamp::now())
            .unwrap();
        assert!(write.packet > 0);

        // Second control pass has nothing further to send.
        let write = engine
            .write_stream(&mut out, None, &[], false, Timestamp::now())
            .unwrap();
        assert_eq!(write.packet, 0);
    }

    #[test]
    fn idle_expiry_drains() {
        let provider = LoopbackProvider::new();
        let configuration = Configuration::builder()
            .max_idle_timeout(Duration::from_millis(1))
            .build();
        let tls = ClientContext::new("localhost");
        let (mut engine, _session) = EngineProvider::<TestPath>::client_new(
            &provider,
            cid(&[9]),
            cid(&[1]),
            TestPath,
            PROTOCOL_VERSION,
            &configuration,
            &tls,
        )
        .unwrap();

        let deadline = engine.expiry().unwrap();
        let result = engine.handle_expiry(deadline + Duration::from_millis(1), &mut NullEvents);
        assert_eq!(result, Err(EngineError::Transport(ERR_IDLE_TIMEOUT)));
        assert!(engine.is_in_draining_period());
    }
}
