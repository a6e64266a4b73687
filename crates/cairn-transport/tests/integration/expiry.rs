//! Idle expiry: both sides go quiet, the idle timer fires, the
//! connection drains and is reaped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use cairn_core::Configuration;
use cairn_engine::testing::{ERR_IDLE_TIMEOUT, PTO};
use cairn_engine::CloseError;
use cairn_transport::{Phase, Status};

use crate::{establish, init_tracing, new_client, start_server, EchoHandler};

#[tokio::test]
async fn idle_connection_expires_and_is_reaped() -> Result<()> {
    init_tracing();
    let configuration = Arc::new(
        Configuration::builder()
            .max_idle_timeout(Duration::from_millis(200))
            .build(),
    );
    let server = start_server(configuration.clone(), Box::new(|| Box::new(EchoHandler))).await?;

    let mut client = new_client(configuration, server.address, Box::new(()))?;
    establish(&mut client).await;
    assert_eq!(server.dispatcher.connection_count(), 1);
    assert!(client.connection().expiry_timeout().is_some());

    // Nobody sends anything; connect() runs until the idle timer tears
    // the connection down.
    let status = tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("idle expiry should terminate the connect loop")?;
    assert_ne!(status, Status::Ok);
    assert!(client.connection().phase() >= Phase::Draining);
    assert_eq!(
        client.connection().last_error(),
        Some(CloseError::Transport(ERR_IDLE_TIMEOUT))
    );

    // The server goes idle on its own clock and is reaped after the
    // drain period.
    tokio::time::sleep(Duration::from_millis(200) + PTO * 3 + Duration::from_millis(200)).await;
    assert_eq!(server.dispatcher.connection_count(), 0);
    assert_eq!(server.dispatcher.route_count(), 0);
    server.stop();
    Ok(())
}
