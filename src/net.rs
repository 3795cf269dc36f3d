//! TCP establishment of a peer connection.
//!
//! The offeror binds the configured address and accepts exactly one peer;
//! the answerer dials it, retrying until the connect timeout elapses.

use anyhow::Result;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};

use crate::config::Settings;
use crate::errors::SyncError;
use crate::transport::{Connection, Role};

const REDIAL_INTERVAL_MS: u64 = 200;

pub async fn connect(settings: &Settings) -> Result<Connection> {
    let stream = match settings.role {
        Role::Offer => accept_one(&settings.address).await?,
        Role::Answer => {
            dial(
                &settings.address,
                Duration::from_secs(settings.connect_timeout_secs),
            )
            .await?
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|e| SyncError::Connection(format!("set TCP_NODELAY: {e}")))?;
    Ok(Connection::new(stream, settings.role))
}

async fn accept_one(address: &str) -> Result<TcpStream> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| SyncError::Connection(format!("bind {address}: {e}")))?;
    let (stream, _peer) = listener
        .accept()
        .await
        .map_err(|e| SyncError::Connection(format!("accept on {address}: {e}")))?;
    Ok(stream)
}

async fn dial(address: &str, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(SyncError::Connection(format!(
                    "connect {address}: {e} (gave up after {}s)",
                    timeout.as_secs()
                ))
                .into());
            }
            Err(_) => sleep(Duration::from_millis(REDIAL_INTERVAL_MS)).await,
        }
    }
}
