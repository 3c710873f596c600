// ABOUTME: PostgreSQL connection helpers for the replica store
// ABOUTME: TLS-preferred connections via native-tls, with retry for startup

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, strip_password_from_url};

/// Retries after the first failed attempt when connecting at startup.
/// Five attempts in total.
pub const CONNECT_RETRIES: u32 = 4;
/// Delay before the first reconnect attempt.
///
/// The delay doubles on every retry (10, 20, 40, 80 seconds) rather than
/// staying fixed, so a replica that stays down is given up on after about
/// two and a half minutes instead of forty seconds.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Certificate handling for replica connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Accept self-signed or otherwise unverifiable certificates
    pub allow_self_signed: bool,
}

fn make_tls_connector(policy: TlsPolicy) -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(policy.allow_self_signed)
        .danger_accept_invalid_hostnames(policy.allow_self_signed)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and drive it on a background task.
///
/// TLS is negotiated according to the URL's `sslmode` (tokio-postgres
/// defaults to `prefer`).
pub async fn connect(url: &str, policy: TlsPolicy) -> Result<Client> {
    let tls = make_tls_connector(policy)?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to PostgreSQL at {}",
                strip_password_from_url(url)
            )
        })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with exponential backoff, for use during process startup.
pub async fn connect_with_retry(url: &str, policy: TlsPolicy) -> Result<Client> {
    retry_with_backoff(
        || connect(url, policy),
        CONNECT_RETRIES,
        CONNECT_RETRY_DELAY,
    )
    .await
}
