//! Stream byte buffers.
//!
//! The send side keeps appended chunks until the peer acknowledges them;
//! `written` tracks bytes already handed to the engine so retransmission
//! state stays inside the engine while the bytes stay here. The invariant
//! `acknowledged <= written <= appended` holds at every step; violating
//! it is an internal bug and panics with a distinctive diagnostic.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer is closed")]
    Closed,

    #[error("cannot consume {requested} bytes, only {available} buffered")]
    ConsumeOverflow { requested: usize, available: usize },
}

/// Send-side buffer: append-only chunks, retired by acknowledgement.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    /// Absolute stream offset of the first byte of `chunks[0]`.
    head: u64,
    acknowledged: u64,
    written: u64,
    appended: u64,
    closed: bool,
    error_code: Option<u64>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue bytes at the tail. Fails once the buffer is closed.
    pub fn append(&mut self, data: impl Into<Bytes>) -> Result<(), BufferError> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.appended += data.len() as u64;
        self.chunks.push_back(data);
        Ok(())
    }

    /// The peer confirmed `size` more bytes; whole chunks below the new
    /// acknowledged offset are discarded, a partially acknowledged head
    /// chunk is kept for its unacked suffix.
    pub fn acknowledge(&mut self, size: u64) {
        let acknowledged = self.acknowledged + size;
        assert!(
            acknowledged <= self.written,
            "stream acknowledged {acknowledged} bytes past written offset {}",
            self.written
        );
        self.acknowledged = acknowledged;

        while let Some(chunk) = self.chunks.front() {
            let end = self.head + chunk.len() as u64;
            if end > self.acknowledged {
                break;
            }
            self.head = end;
            self.chunks.pop_front();
        }
    }

    /// Zero-copy views of the bytes not yet handed to the engine,
    /// `[written, appended)`. Crossing a chunk boundary yields multiple
    /// views.
    pub fn pending_chunks(&self) -> Vec<&[u8]> {
        let mut views = Vec::new();
        let mut start = self.head;
        for chunk in &self.chunks {
            let end = start + chunk.len() as u64;
            if end <= self.written {
                start = end;
                continue;
            }
            if start < self.written {
                let skip = (self.written - start) as usize;
                views.push(&chunk[skip..]);
            } else {
                views.push(&chunk[..]);
            }
            start = end;
        }
        views
    }

    /// Mark `size` more bytes as written to the engine.
    pub fn increment(&mut self, size: u64) {
        let written = self.written + size;
        assert!(
            written <= self.appended,
            "stream wrote {written} bytes past appended total {}",
            self.appended
        );
        self.written = written;
    }

    /// Close the buffer; the next engine write asserts FIN (and reset
    /// semantics when an error code is set). Further appends fail.
    pub fn close(&mut self, error_code: Option<u64>) {
        self.closed = true;
        if self.error_code.is_none() {
            self.error_code = error_code;
        }
    }

    /// Close and drop everything not yet written; the peer asked us to
    /// stop sending.
    pub fn stop_sending(&mut self) {
        self.closed = true;
        self.chunks.clear();
        self.head = self.appended;
        self.written = self.appended;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn error_code(&self) -> Option<u64> {
        self.error_code
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Bytes appended but not yet handed to the engine.
    pub fn pending_len(&self) -> u64 {
        self.appended - self.written
    }

    /// True when every appended byte has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.acknowledged == self.appended
    }

    /// Number of retained chunks; storage below the acknowledged offset
    /// must have been discarded.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Receive-side buffer: a contiguous byte string assembled from the
/// engine's in-order delivery.
#[derive(Debug, Default)]
pub struct InputBuffer {
    data: Vec<u8>,
    closed: bool,
    error_code: Option<u64>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Drop the first `size` bytes.
    pub fn consume(&mut self, size: usize) -> Result<(), BufferError> {
        if size > self.data.len() {
            return Err(BufferError::ConsumeOverflow {
                requested: size,
                available: self.data.len(),
            });
        }
        self.data.drain(..size);
        Ok(())
    }

    /// View of the remaining bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Close on FIN or reset.
    pub fn close(&mut self, error_code: Option<u64>) {
        self.closed = true;
        if self.error_code.is_none() {
            self.error_code = error_code;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn error_code(&self) -> Option<u64> {
        self.error_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concatenated(buffer: &OutputBuffer) -> Vec<u8> {
        let mut all = Vec::new();
        for view in buffer.pending_chunks() {
            all.extend_from_slice(view);
        }
        all
    }

    #[test]
    fn counters_stay_ordered() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"hello ")).unwrap();
        buffer.append(Bytes::from_static(b"world")).unwrap();
        assert_eq!(buffer.appended(), 11);

        buffer.increment(6);
        buffer.acknowledge(3);
        assert!(buffer.acknowledged() <= buffer.written());
        assert!(buffer.written() <= buffer.appended());

        buffer.increment(5);
        buffer.acknowledge(8);
        assert_eq!(buffer.acknowledged(), 11);
        assert_eq!(buffer.written(), 11);
    }

    #[test]
    fn pending_chunks_cover_unwritten_bytes() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"abcd")).unwrap();
        buffer.append(Bytes::from_static(b"efgh")).unwrap();
        buffer.append(Bytes::from_static(b"ij")).unwrap();

        buffer.increment(6);
        // [written, appended) crosses a chunk boundary: two views.
        let views = buffer.pending_chunks();
        assert_eq!(views.len(), 2);
        assert_eq!(concatenated(&buffer), b"ghij");

        buffer.increment(4);
        assert!(buffer.pending_chunks().is_empty());
    }

    #[test]
    fn full_ack_round_trip_discards_storage() {
        let mut buffer = OutputBuffer::new();
        let payload = Bytes::from_static(b"round trip payload");
        buffer.append(payload.clone()).unwrap();
        buffer.increment(payload.len() as u64);
        buffer.acknowledge(payload.len() as u64);

        assert!(buffer.pending_chunks().is_empty());
        assert_eq!(buffer.chunk_count(), 0);
        assert!(buffer.is_drained());
    }

    #[test]
    fn partial_ack_keeps_head_suffix() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"abcdef")).unwrap();
        buffer.increment(6);
        buffer.acknowledge(4);

        // The chunk straddles the acknowledged offset, so it is retained.
        assert_eq!(buffer.chunk_count(), 1);
        buffer.acknowledge(2);
        assert_eq!(buffer.chunk_count(), 0);
    }

    #[test]
    #[should_panic(expected = "past written offset")]
    fn over_acknowledge_panics() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"ab")).unwrap();
        buffer.increment(1);
        buffer.acknowledge(2);
    }

    #[test]
    #[should_panic(expected = "past appended total")]
    fn over_increment_panics() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"ab")).unwrap();
        buffer.increment(3);
    }

    #[test]
    fn closed_buffer_rejects_append() {
        let mut buffer = OutputBuffer::new();
        buffer.close(None);
        assert_eq!(
            buffer.append(Bytes::from_static(b"late")),
            Err(BufferError::Closed)
        );
        assert!(buffer.is_closed());
    }

    #[test]
    fn first_error_code_wins() {
        let mut buffer = OutputBuffer::new();
        buffer.close(Some(7));
        buffer.close(Some(9));
        assert_eq!(buffer.error_code(), Some(7));
    }

    #[test]
    fn stop_sending_drops_pending() {
        let mut buffer = OutputBuffer::new();
        buffer.append(Bytes::from_static(b"unsent data")).unwrap();
        buffer.increment(2);
        buffer.stop_sending();

        assert!(buffer.is_closed());
        assert!(buffer.pending_chunks().is_empty());
        assert_eq!(buffer.chunk_count(), 0);
        assert!(buffer.append(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn input_append_consume() {
        let mut buffer = InputBuffer::new();
        buffer.append(b"Hello ").unwrap();
        buffer.append(b"World").unwrap();
        assert_eq!(buffer.data(), b"Hello World");

        buffer.consume(6).unwrap();
        assert_eq!(buffer.data(), b"World");

        let err = buffer.consume(6).unwrap_err();
        assert_eq!(
            err,
            BufferError::ConsumeOverflow {
                requested: 6,
                available: 5
            }
        );
    }

    #[test]
    fn input_close_records_code_and_blocks_append() {
        let mut buffer = InputBuffer::new();
        buffer.append(b"tail").unwrap();
        buffer.close(Some(7));
        assert!(buffer.is_closed());
        assert_eq!(buffer.error_code(), Some(7));
        assert_eq!(buffer.append(b"more"), Err(BufferError::Closed));
        // Buffered data stays readable after close.
        assert_eq!(buffer.data(), b"tail");
    }
}
