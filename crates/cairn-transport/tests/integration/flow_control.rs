//! Flow control and peer-reset scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;

use cairn_core::Configuration;
use cairn_transport::{ConnectionHandler, Stream};

use crate::{drive_client_until, establish, init_tracing, new_client, start_server};

/// Consumes everything it receives and counts the bytes.
struct SinkHandler {
    total: Arc<AtomicUsize>,
}

impl ConnectionHandler for SinkHandler {
    fn stream_data(&mut self, stream: &mut Stream) {
        let pending = stream.input().len();
        if pending > 0 {
            stream.consume(pending).unwrap();
            self.total.fetch_add(pending, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn flow_control_blocks_at_the_window_then_extends() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(Configuration::new());
    let window = configuration
        .transport_parameters()
        .initial_max_stream_data_bidi_remote;
    assert_eq!(window, 128 * 1024);

    let total = Arc::new(AtomicUsize::new(0));
    let sink_total = total.clone();
    let server = start_server(
        configuration.clone(),
        Box::new(move || {
            Box::new(SinkHandler {
                total: sink_total.clone(),
            })
        }),
    )
    .await?;

    let mut client = new_client(configuration, server.address, Box::new(()))?;
    establish(&mut client).await;

    let stream_id = client.connection_mut().open_bidirectional_stream()?;
    let mut payload = vec![0u8; 256 * 1024];
    rand::thread_rng().fill(&mut payload[..]);
    client
        .connection_mut()
        .stream_mut(stream_id)
        .unwrap()
        .append(payload)?;

    // One send pass with no incoming extensions: the engine consumes
    // exactly the advertised window and then reports the stream blocked.
    client.connection_mut().send_packets().await?;
    let written_after_block = client
        .connection()
        .stream(stream_id)
        .unwrap()
        .output()
        .written();
    assert_eq!(written_after_block, u64::from(window));

    // The peer's extensions release the rest, and everything gets
    // acknowledged.
    drive_client_until(&mut client, |connection| {
        connection
            .stream(stream_id)
            .map(|stream| stream.output().acknowledged() == 256 * 1024)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(total.load(Ordering::SeqCst), 256 * 1024);
    assert_eq!(client.connection().last_error(), None);
    server.stop();
    Ok(())
}

/// Resets its write side with error code 7 as soon as data arrives.
struct ResetHandler;

impl ConnectionHandler for ResetHandler {
    fn stream_data(&mut self, stream: &mut Stream) {
        let pending = stream.input().len();
        if pending > 0 {
            stream.consume(pending).unwrap();
            stream.shutdown_write(7);
        }
    }
}

#[tokio::test]
async fn peer_reset_closes_the_output_buffer_with_its_code() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(Configuration::new());
    let server = start_server(configuration.clone(), Box::new(|| Box::new(ResetHandler))).await?;

    let mut client = new_client(configuration, server.address, Box::new(()))?;
    establish(&mut client).await;

    let stream_id = client.connection_mut().open_bidirectional_stream()?;
    client
        .connection_mut()
        .stream_mut(stream_id)
        .unwrap()
        .append(&b"anything there?"[..])?;

    // Drive until the peer's reset lands on the stream.
    drive_client_until(&mut client, |connection| {
        connection
            .stream(stream_id)
            .map(|stream| stream.output().error_code() == Some(7))
            .unwrap_or(false)
    })
    .await;

    let stream = client.connection().stream(stream_id).unwrap();
    assert!(stream.output().is_closed());
    assert_eq!(stream.output().error_code(), Some(7));
    // The read side stays open, and no stream payload ever came back.
    assert!(!stream.input().is_closed());
    assert!(stream.input().is_empty());
    assert_eq!(client.connection().last_error(), None);
    server.stop();
    Ok(())
}
