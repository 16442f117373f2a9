//! PeerCall demo
//!
//! Starts an in-process signaling hub and two call managers backed by real
//! WebRTC peer connections, places a call from one to the other, holds it for
//! a while and hangs up.
//!
//! Usage: peercall [--video] [--hold <secs>]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::try_join;

use peercall::call::{CallConfig, CallHandle, CallManager};
use peercall::media::VirtualDevices;
use peercall::models::{CallKind, CallState};
use peercall::signaling::{HubConnection, SignalingHub};
use peercall::state::CallEvent;
use peercall::transport::WebRtcTransportFactory;

const DEFAULT_HOLD_SECS: u64 = 3;

fn hold_duration(args: &[String]) -> Result<Duration> {
    match args.iter().position(|a| a == "--hold") {
        Some(i) => {
            let secs: u64 = args
                .get(i + 1)
                .context("--hold needs a number of seconds")?
                .parse()
                .context("--hold needs a number of seconds")?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(DEFAULT_HOLD_SECS)),
    }
}

async fn start_manager(
    hub: &SignalingHub,
    config: CallConfig,
    transports: Arc<WebRtcTransportFactory>,
) -> Result<(CallHandle, Arc<HubConnection>)> {
    let (connection, inbound) = hub.connect(&config.user_id).await;
    let connection = Arc::new(connection);
    let handle = CallManager::spawn(
        config,
        Arc::new(VirtualDevices::default()),
        transports,
        connection.clone(),
        inbound,
    )?;
    Ok((handle, connection))
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("peercall=info".parse()?))
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let hold = hold_duration(&args)?;
    let kind = if args.iter().any(|a| a == "--video") {
        CallKind::Video
    } else {
        CallKind::Voice
    };

    let caller_config = CallConfig::from_env().unwrap_or_else(|| CallConfig::new("alice", "Alice"));
    if caller_config.user_id == "bob" {
        bail!("CALL_USER_ID must not be \"bob\"; that id is taken by the demo callee");
    }
    let callee_config = CallConfig {
        user_id: "bob".to_string(),
        display_name: "Bob".to_string(),
        ..caller_config.clone()
    };

    let hub = SignalingHub::new();
    let transports = Arc::new(WebRtcTransportFactory::new()?);
    let (caller, caller_connection) = start_manager(&hub, caller_config, transports.clone()).await?;
    let (callee, callee_connection) = start_manager(&hub, callee_config, transports).await?;

    // The callee answers whatever rings
    let answering = callee.clone();
    let mut callee_events = callee.events();
    tokio::spawn(async move {
        while let Ok(event) = callee_events.recv().await {
            if let CallEvent::IncomingCall { peer_name, kind, .. } = event {
                tracing::info!("{} is calling ({}), answering", peer_name, kind);
                if let Err(e) = answering.accept_call().await {
                    tracing::error!("Failed to answer: {}", e);
                }
            }
        }
    });

    tracing::info!("Calling {} ({})", callee.user_id(), kind);
    caller.initiate_call(callee.user_id(), "Bob", kind).await?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(45),
        caller.wait_for(|s| s.state == CallState::Active || !s.is_in_call()),
    )
    .await
    .context("call did not connect in time")??;

    if outcome.state == CallState::Active {
        tokio::time::timeout(Duration::from_secs(5), callee.wait_for(|s| s.state == CallState::Active))
            .await
            .context("callee never went active")??;

        tracing::info!("Call connected, holding for {}s", hold.as_secs());
        tokio::time::sleep(hold).await;
        caller.end_call().await?;

        tokio::time::timeout(
            Duration::from_secs(5),
            try_join(
                caller.wait_for(|s| !s.is_in_call()),
                callee.wait_for(|s| !s.is_in_call()),
            ),
        )
        .await
        .context("hangup did not reach both ends")??;
    } else {
        tracing::warn!("Call failed: {:?}", outcome.last_error);
    }

    for (name, handle) in [("caller", &caller), ("callee", &callee)] {
        let snapshot = handle.snapshot();
        println!(
            "{:<6} {:<10} {:<8} {}",
            name,
            snapshot.state.display_name(),
            snapshot.formatted_duration(),
            snapshot.status_text()
        );
    }

    caller.shutdown().await?;
    callee.shutdown().await?;
    caller_connection.disconnect().await;
    callee_connection.disconnect().await;

    Ok(())
}
