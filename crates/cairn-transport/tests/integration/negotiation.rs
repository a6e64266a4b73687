//! Version negotiation: an unsupported version elicits a negotiation
//! datagram and never creates a connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use cairn_core::{Configuration, ConnectionId, Ecn, SecureRandom, Timestamp};
use cairn_engine::testing::{decode_version_negotiation, encode_initial_datagram, PROTOCOL_VERSION};
use cairn_transport::Socket;

use crate::{init_tracing, start_server, EchoHandler};

#[tokio::test]
async fn unsupported_version_gets_negotiated() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(Configuration::new());
    let server = start_server(configuration, Box::new(|| Box::new(EchoHandler))).await?;

    let mut random = SecureRandom::new();
    let dcid = ConnectionId::random(8, &mut random)?;
    let scid = ConnectionId::random(8, &mut random)?;

    let socket = Socket::bound("127.0.0.1:0".parse()?)?;
    let datagram = encode_initial_datagram(0x1a2a_3a4a, &dcid, &scid);
    socket
        .send_packet(&datagram, server.address, Ecn::NotEct, None)
        .await?;

    let mut buffer = [0u8; 256];
    let deadline = Timestamp::now() + Duration::from_secs(2);
    let received = socket
        .receive_packet(&mut buffer, Some(deadline))
        .await?
        .context("version negotiation reply expected")?;

    let (header, versions) = decode_version_negotiation(&buffer[..received.len])
        .context("reply is not a negotiation datagram")?;
    assert!(versions.contains(&PROTOCOL_VERSION));
    // The reply echoes our CIDs swapped, so we can route it.
    assert_eq!(header.dcid, scid);
    assert_eq!(header.scid, dcid);

    // No connection state was created for the probe.
    assert_eq!(server.dispatcher.connection_count(), 0);
    assert_eq!(server.dispatcher.route_count(), 0);
    server.stop();
    Ok(())
}
