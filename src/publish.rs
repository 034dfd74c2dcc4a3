use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::models::Notification;

/// Fire-and-forget delivery of outbound events.
///
/// `publish` must return without waiting on the network; failures are the
/// implementation's to log and drop.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn publish(&self, notification: Notification);

    /// Wait for deliveries still in flight. Short-lived processes call this
    /// before exiting.
    async fn flush(&self) {}
}

/// Posts to a Dapr sidecar's publish endpoint on a background task.
#[derive(Debug, Clone)]
pub struct DaprPublisher {
    client: reqwest::Client,
    base_url: String,
    pubsub_name: String,
    in_flight: Arc<Mutex<JoinSet<()>>>,
}

impl DaprPublisher {
    pub fn new(base_url: &str, pubsub_name: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            pubsub_name: pubsub_name.to_string(),
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        })
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1.0/publish/{}/{}", self.base_url, self.pubsub_name, topic)
    }
}

#[async_trait]
impl Publisher for DaprPublisher {
    fn publish(&self, notification: Notification) {
        let url = self.topic_url(notification.topic());
        let client = self.client.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%url, "no async runtime available, dropping notification");
            return;
        };

        let delivery = async move {
            match client.post(&url).json(&notification).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, "notification delivered");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "notification rejected by pubsub");
                }
                Err(err) => {
                    warn!(%url, error = %err, "notification delivery failed");
                }
            }
        };

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished deliveries so the set does not grow without bound.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn_on(delivery, &handle);
    }

    async fn flush(&self) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *in_flight)
        };
        while pending.join_next().await.is_some() {}
    }
}

/// Used when no bus is configured: events only reach the log.
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    fn publish(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(payload) => debug!(topic = notification.topic(), %payload, "notification"),
            Err(err) => warn!(error = %err, "failed to encode notification"),
        }
    }
}
