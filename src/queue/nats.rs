//! NATS client wrapper and the NATS-backed analysis queue

use async_nats::{jetstream, Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{AnalysedReportMessage, AnalysisQueue, RawReportMessage};
use crate::config::NatsArgs;
use crate::types::{GatehouseError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// NATS client wrapper
#[derive(Clone)]
pub struct NatsClient {
    /// Underlying NATS client
    client: Client,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        // No retry_on_initial_connect: startup should fail fast when NATS is
        // down. Reconnection still works after the first connect.
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| GatehouseError::Queue(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self { client })
    }

    /// Get the underlying NATS client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Core publish followed by a flush, so the server has the message
    /// before this returns
    pub async fn publish_flushed(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| GatehouseError::Queue(format!("Publish failed: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| GatehouseError::Queue(format!("Flush failed: {}", e)))
    }
}

/// Analysis queue over NATS
pub struct NatsQueue {
    client: NatsClient,
    jetstream: Option<jetstream::Context>,
    raw_subject: String,
    analysed_subject: String,
}

impl NatsQueue {
    /// Build a queue from a connected client. With `args.nats_jetstream`
    /// every publish waits for the stream's ack.
    pub fn new(client: NatsClient, args: &NatsArgs) -> Self {
        let jetstream = args
            .nats_jetstream
            .then(|| jetstream::new(client.inner().clone()));

        Self {
            client,
            jetstream,
            raw_subject: args.raw_subject.clone(),
            analysed_subject: args.analysed_subject.clone(),
        }
    }

    async fn publish_json<T: Serialize>(&self, subject: &str, message: &T) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(message).map_err(|e| {
            GatehouseError::Internal(format!("Failed to encode queue message: {}", e))
        })?);

        match &self.jetstream {
            Some(js) => {
                let ack = js
                    .publish(subject.to_string(), payload)
                    .await
                    .map_err(|e| GatehouseError::Queue(format!("Publish to {} failed: {}", subject, e)))?
                    .await
                    .map_err(|e| GatehouseError::Queue(format!("No ack from {}: {}", subject, e)))?;
                debug!(subject, stream = %ack.stream, sequence = ack.sequence, "Published");
                Ok(())
            }
            None => self.client.publish_flushed(subject, payload).await,
        }
    }
}

#[async_trait]
impl AnalysisQueue for NatsQueue {
    async fn publish_raw(&self, message: &RawReportMessage) -> Result<()> {
        self.publish_json(&self.raw_subject, message).await
    }

    async fn publish_analysed(&self, message: &AnalysedReportMessage) -> Result<()> {
        self.publish_json(&self.analysed_subject, message).await
    }

    fn name(&self) -> &'static str {
        if self.jetstream.is_some() {
            "nats-jetstream"
        } else {
            "nats"
        }
    }
}
