use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::Client;
use tracing::{debug, error, warn};

use crate::crawler::progress::ProgressEnvelope;

use super::hub::BroadcastHub;

/// Redis channel carrying cross-instance progress envelopes.
const PROGRESS_CHANNEL: &str = "sitescan:progress";

/// Cross-instance fan-out seam. The hub forwards every delivered event
/// here so subscribers attached to other instances see it too.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: &ProgressEnvelope) -> Result<()>;
}

/// Single-instance mode: no cross-instance fan-out.
pub struct NullBus;

#[async_trait]
impl EventBus for NullBus {
    async fn publish(&self, _envelope: &ProgressEnvelope) -> Result<()> {
        Ok(())
    }
}

/// Redis pub/sub bus. `publish` pushes envelopes; [`RedisBus::start_listener`]
/// re-delivers envelopes originating from other instances locally.
pub struct RedisBus {
    client: Client,
    conn: tokio::sync::Mutex<redis::aio::MultiplexedConnection>,
}

impl RedisBus {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to connect to Redis at {redis_url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Spawn the subscription task feeding remote envelopes into the hub.
    pub async fn start_listener(&self, hub: Arc<BroadcastHub>) -> Result<()> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("Failed to open pub/sub connection")?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(PROGRESS_CHANNEL)
            .await
            .context("Failed to subscribe to progress channel")?;

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("unreadable bus payload: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<ProgressEnvelope>(&payload) {
                    Ok(envelope) => hub.deliver_remote(envelope).await,
                    Err(e) => warn!("malformed bus envelope: {e}"),
                }
            }
            debug!("bus listener stopped");
        });

        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, envelope: &ProgressEnvelope) -> Result<()> {
        let payload =
            serde_json::to_string(envelope).context("Failed to serialize progress envelope")?;

        let mut conn = self.conn.lock().await;
        if let Err(e) = redis::cmd("PUBLISH")
            .arg(PROGRESS_CHANNEL)
            .arg(&payload)
            .query_async::<_, ()>(&mut *conn)
            .await
        {
            error!("bus publish failed: {e}");
            return Err(e).context("Failed to publish progress envelope");
        }
        Ok(())
    }
}
