// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use etcd_client::ConnectOptions;
use parking_lot::RwLock;
use tokio::time::sleep;

use crate::config::RegistryConfig;

/// Manages the etcd client connection with reconnection support.
pub struct Connector {
    /// The actual etcd client, protected by RwLock for safe updates during
    /// reconnection.
    client: RwLock<etcd_client::Client>,
    endpoints: Vec<String>,
    connect_options: ConnectOptions,
    /// Initial backoff duration for reconnection attempts
    initial_backoff: Duration,
    /// Maximum backoff duration for reconnection attempts
    max_backoff: Duration,
}

impl Connector {
    /// Create a new connector with an established connection.
    pub async fn new(config: &RegistryConfig) -> Result<Arc<Self>> {
        let connect_options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(config.dial_timeout_ms))
            .with_timeout(Duration::from_millis(config.op_timeout_ms));
        let client = Self::connect(&config.endpoints, &connect_options).await?;

        Ok(Arc::new(Self {
            client: RwLock::new(client),
            endpoints: config.endpoints.clone(),
            connect_options,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }))
    }

    async fn connect(
        endpoints: &[String],
        connect_options: &ConnectOptions,
    ) -> Result<etcd_client::Client> {
        etcd_client::Client::connect(endpoints.to_vec(), Some(connect_options.clone()))
            .await
            .with_context(|| {
                format!(
                    "unable to connect to registry at {}",
                    endpoints.join(", ")
                )
            })
    }

    /// Get a clone of the current etcd client.
    pub fn client(&self) -> etcd_client::Client {
        self.client.read().clone()
    }

    /// Reconnect with capped exponential backoff, bounded by `deadline`.
    pub async fn reconnect(&self, deadline: std::time::Instant) -> Result<()> {
        tracing::warn!(endpoints = ?self.endpoints, "reconnecting to registry");

        let mut backoff = self.initial_backoff;

        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                anyhow::bail!("unable to reconnect to registry: deadline exceeded");
            }
            let remaining = deadline.saturating_duration_since(now);
            backoff = std::cmp::min(std::cmp::min(backoff, remaining / 2), self.max_backoff);
            sleep(backoff).await;

            match Self::connect(&self.endpoints, &self.connect_options).await {
                Ok(new_client) => {
                    tracing::info!("reconnected to registry");
                    let mut client_guard = self.client.write();
                    *client_guard = new_client;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(remaining = ?remaining, error = %e, "reconnection failed");
                    backoff *= 2;
                }
            }
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}
