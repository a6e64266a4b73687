//! Per-stream state.
//!
//! Streams are owned by their connection's table and only ever removed
//! through the engine's close callback. Application writes land in the
//! output buffer and flag the stream for the connection's next send pass;
//! nothing here touches the engine directly, so stream methods are safe
//! to call from inside engine callbacks.

use bytes::Bytes;

use cairn_engine::StreamId;

use crate::buffer::{BufferError, InputBuffer, OutputBuffer};

/// A deferred shutdown request, serviced by the connection once the
/// engine is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    Read { error_code: u64 },
    Write { error_code: u64 },
    Both { error_code: u64 },
}

#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    input: InputBuffer,
    output: OutputBuffer,
    wants_send: bool,
    shutdown_request: Option<ShutdownRequest>,
}

impl Stream {
    pub(crate) fn new(id: StreamId) -> Self {
        Stream {
            id,
            input: InputBuffer::new(),
            output: OutputBuffer::new(),
            wants_send: false,
            shutdown_request: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queue bytes for transmission, in append order.
    pub fn append(&mut self, data: impl Into<Bytes>) -> Result<(), BufferError> {
        self.output.append(data)?;
        self.wants_send = true;
        Ok(())
    }

    /// Close the send side; FIN is transmitted at-or-after the last
    /// appended byte.
    pub fn finish(&mut self) {
        self.output.close(None);
        self.wants_send = true;
    }

    /// Received bytes not yet consumed by the application.
    pub fn input(&self) -> &InputBuffer {
        &self.input
    }

    /// Drop `size` bytes from the front of the input buffer.
    pub fn consume(&mut self, size: usize) -> Result<(), BufferError> {
        self.input.consume(size)
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Ask the connection to tell the peer to stop sending.
    pub fn shutdown_read(&mut self, error_code: u64) {
        self.merge_shutdown(ShutdownRequest::Read { error_code });
    }

    /// Ask the connection to reset the send side.
    pub fn shutdown_write(&mut self, error_code: u64) {
        self.merge_shutdown(ShutdownRequest::Write { error_code });
    }

    /// Shut down both directions.
    pub fn shutdown(&mut self, error_code: u64) {
        self.merge_shutdown(ShutdownRequest::Both { error_code });
    }

    fn merge_shutdown(&mut self, request: ShutdownRequest) {
        self.shutdown_request = Some(match (self.shutdown_request, request) {
            (None, request) => request,
            (Some(existing), incoming) if existing == incoming => existing,
            // Read + Write from either order collapses to Both; Both wins
            // over everything. The first error code is kept.
            (Some(ShutdownRequest::Both { error_code }), _) => {
                ShutdownRequest::Both { error_code }
            }
            (Some(ShutdownRequest::Read { error_code }), ShutdownRequest::Write { .. })
            | (Some(ShutdownRequest::Write { error_code }), ShutdownRequest::Read { .. })
            | (Some(ShutdownRequest::Read { error_code }), ShutdownRequest::Both { .. })
            | (Some(ShutdownRequest::Write { error_code }), ShutdownRequest::Both { .. }) => {
                ShutdownRequest::Both { error_code }
            }
            (Some(existing), _) => existing,
        });
    }

    pub(crate) fn take_shutdown_request(&mut self) -> Option<ShutdownRequest> {
        self.shutdown_request.take()
    }

    pub(crate) fn input_mut(&mut self) -> &mut InputBuffer {
        &mut self.input
    }

    pub(crate) fn output_mut(&mut self) -> &mut OutputBuffer {
        &mut self.output
    }

    pub(crate) fn wants_send(&self) -> bool {
        self.wants_send || self.output.pending_len() > 0
    }

    pub(crate) fn mark_send(&mut self) {
        self.wants_send = true;
    }

    pub(crate) fn clear_send(&mut self) {
        self.wants_send = false;
    }

    /// Close both buffers; the connection is going away.
    pub(crate) fn disconnect(&mut self) {
        self.input.close(None);
        self.output.close(None);
    }
}
