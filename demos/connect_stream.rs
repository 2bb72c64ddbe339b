//! Connect to a local portal event stream and print booking events.
//!
//! Expects a session saved by the `send_request` demo. The stream never
//! reconnects on its own; this demo reconnects after recoverable closures and
//! stops when the server denies authorization.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use portal_access::credentials::{CredentialStore, FileStorage};
use portal_access::stream::client::{EventStreamClient, StreamOptions};
use portal_access::stream::status::StreamStatus;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct BookingEvent {
    id: u64,
    #[serde(default)]
    status: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = CredentialStore::load(Arc::new(FileStorage::new(".portal-session.json")));
    let client = EventStreamClient::new(store, StreamOptions::default());

    client.subscribe_as("booking.created", |event: BookingEvent| {
        println!("booking created id={}", event.id);
    });
    client.subscribe_as("booking.updated", |event: BookingEvent| {
        println!(
            "booking updated id={} status={}",
            event.id,
            event.status.as_deref().unwrap_or("-")
        );
    });

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    client.on_status_change(move |status| {
        let _ = status_tx.send(status.clone());
    });

    client.connect()?;
    while let Some(status) = status_rx.recv().await {
        match status {
            StreamStatus::Connected => println!("connected"),
            StreamStatus::Error(fault) if fault.fatal => {
                eprintln!("{}", fault.message);
                break;
            }
            StreamStatus::Error(fault) => {
                eprintln!("{}; reconnecting", fault.message);
                tokio::time::sleep(Duration::from_secs(2)).await;
                client.reconnect()?;
            }
            StreamStatus::Disconnected => break,
            StreamStatus::Connecting => {}
        }
    }

    client.disconnect();
    Ok(())
}
