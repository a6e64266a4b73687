//! Stream data scenarios: loopback echo and interleaved transfers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use cairn_core::Configuration;
use cairn_engine::testing::PTO;
use cairn_engine::StreamId;
use cairn_transport::{ConnectionHandler, Phase, Stream};

use crate::{
    drive_client_until, establish, init_tracing, new_client, start_server, CollectHandler,
    EchoHandler,
};

#[tokio::test]
async fn loopback_echo_single_stream() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(Configuration::new());
    let server = start_server(configuration.clone(), Box::new(|| Box::new(EchoHandler))).await?;

    let (handler, probes) = CollectHandler::new();
    let mut client = new_client(configuration, server.address, Box::new(handler))?;
    establish(&mut client).await;

    let stream_id = client.connection_mut().open_bidirectional_stream()?;
    {
        let stream = client.connection_mut().stream_mut(stream_id).unwrap();
        stream.append(&b"Hello World"[..])?;
        stream.finish();
    }

    drive_client_until(&mut client, |_| probes.input_closed.load(Ordering::SeqCst)).await;
    assert_eq!(probes.received.lock().unwrap().as_slice(), b"Hello World");
    assert_eq!(client.connection().last_error(), None);

    // Both halves acknowledged: the engine retires the stream.
    drive_client_until(&mut client, |connection| connection.stream_count() == 0).await;

    client.connection_mut().close().await?;
    assert!(client.connection().phase() >= Phase::Draining);

    // The dispatcher reaps the drained server within 3 x PTO.
    tokio::time::sleep(PTO * 3 + Duration::from_millis(150)).await;
    assert_eq!(server.dispatcher.connection_count(), 0);
    assert_eq!(server.dispatcher.route_count(), 0);
    server.stop();
    Ok(())
}

/// Collects received bytes per stream id.
struct PerStreamCollector {
    data: Arc<Mutex<HashMap<StreamId, Vec<u8>>>>,
    closed: Arc<Mutex<HashSet<StreamId>>>,
}

impl ConnectionHandler for PerStreamCollector {
    fn stream_data(&mut self, stream: &mut Stream) {
        let pending = stream.input().data().to_vec();
        if !pending.is_empty() {
            stream.consume(pending.len()).unwrap();
            self.data
                .lock()
                .unwrap()
                .entry(stream.id())
                .or_default()
                .extend_from_slice(&pending);
        }
        if stream.input().is_closed() {
            self.closed.lock().unwrap().insert(stream.id());
        }
    }
}

#[tokio::test]
async fn two_streams_interleaved() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(Configuration::new());
    let server = start_server(configuration.clone(), Box::new(|| Box::new(EchoHandler))).await?;

    let data = Arc::new(Mutex::new(HashMap::new()));
    let closed = Arc::new(Mutex::new(HashSet::new()));
    let handler = PerStreamCollector {
        data: data.clone(),
        closed: closed.clone(),
    };
    let mut client = new_client(configuration, server.address, Box::new(handler))?;
    establish(&mut client).await;

    let mut payloads: HashMap<StreamId, Vec<u8>> = HashMap::new();
    for _ in 0..2 {
        let stream_id = client.connection_mut().open_bidirectional_stream()?;
        let mut payload = vec![0u8; 10 * 1024];
        rand::thread_rng().fill(&mut payload[..]);
        let stream = client.connection_mut().stream_mut(stream_id).unwrap();
        stream.append(payload.clone())?;
        stream.finish();
        payloads.insert(stream_id, payload);
    }

    let expected: HashSet<StreamId> = payloads.keys().copied().collect();
    drive_client_until(&mut client, |_| *closed.lock().unwrap() == expected).await;

    let echoed = data.lock().unwrap();
    for (stream_id, payload) in &payloads {
        assert_eq!(
            echoed.get(stream_id).map(Vec::len),
            Some(payload.len()),
            "stream {stream_id} length mismatch"
        );
        assert_eq!(
            echoed.get(stream_id).unwrap(),
            payload,
            "stream {stream_id} payload corrupted"
        );
    }
    drop(echoed);

    assert_eq!(client.connection().last_error(), None);
    server.stop();
    Ok(())
}
