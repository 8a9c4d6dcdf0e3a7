use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::types::with_fifo_suffix;
use crate::{attributes, Broker, BrokerError, QueueHandle, DEAD_LETTER_SUFFIX, FIFO_SUFFIX};

pub const LONG_POLL_WAIT_SECONDS: i32 = 20;

/// Resolves subscriber queues (and their dead-letter queues) by name,
/// creating them when absent.
#[derive(Clone)]
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    visibility_timeout_seconds: Option<u32>,
}

impl QueueRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            visibility_timeout_seconds: None,
        }
    }

    /// Visibility timeout applied to queues this registry creates.
    pub fn with_visibility_timeout(mut self, seconds: Option<u32>) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    pub fn queue_name(subscriber_id: &str, fifo: bool) -> String {
        with_fifo_suffix(base_name(subscriber_id), fifo)
    }

    pub fn dead_letter_queue_name(subscriber_id: &str, fifo: bool) -> String {
        let base = base_name(subscriber_id);
        with_fifo_suffix(&format!("{base}{DEAD_LETTER_SUFFIX}"), fifo)
    }

    /// Looks up a queue by exact name. Prefix matches that are not exact
    /// (e.g. the `_dlq` sibling) are ignored.
    pub async fn find_queue(&self, name: &str) -> Result<Option<QueueHandle>, BrokerError> {
        let urls = self.broker.list_queues(base_name(name)).await?;
        Ok(urls
            .into_iter()
            .find(|url| last_segment(url) == name)
            .map(|url| QueueHandle {
                name: name.to_string(),
                url,
            }))
    }

    pub async fn ensure_queue(
        &self,
        subscriber_id: &str,
        fifo: bool,
    ) -> Result<QueueHandle, BrokerError> {
        self.ensure_named(&Self::queue_name(subscriber_id, fifo), fifo)
            .await
    }

    pub async fn ensure_dead_letter_queue(
        &self,
        subscriber_id: &str,
        fifo: bool,
    ) -> Result<QueueHandle, BrokerError> {
        self.ensure_named(&Self::dead_letter_queue_name(subscriber_id, fifo), fifo)
            .await
    }

    async fn ensure_named(&self, name: &str, fifo: bool) -> Result<QueueHandle, BrokerError> {
        if let Some(existing) = self.find_queue(name).await? {
            debug!("Queue {} resolved to {}", name, existing.url);
            return Ok(existing);
        }

        let url = self
            .broker
            .create_queue(name, self.creation_attributes(fifo))
            .await?;
        info!("Created queue {} ({})", name, url);
        Ok(QueueHandle {
            name: name.to_string(),
            url,
        })
    }

    fn creation_attributes(&self, fifo: bool) -> HashMap<String, String> {
        let mut attrs = HashMap::from([(
            attributes::RECEIVE_MESSAGE_WAIT_TIME_SECONDS.to_string(),
            LONG_POLL_WAIT_SECONDS.to_string(),
        )]);
        if fifo {
            attrs.insert(attributes::FIFO_QUEUE.to_string(), "true".to_string());
            attrs.insert(
                attributes::CONTENT_BASED_DEDUPLICATION.to_string(),
                "true".to_string(),
            );
        }
        if let Some(seconds) = self.visibility_timeout_seconds {
            attrs.insert(
                attributes::VISIBILITY_TIMEOUT.to_string(),
                seconds.to_string(),
            );
        }
        attrs
    }
}

/// Subscriber id without a trailing `.fifo`, so derived names carry the
/// suffix exactly once.
fn base_name(subscriber_id: &str) -> &str {
    subscriber_id
        .strip_suffix(FIFO_SUFFIX)
        .unwrap_or(subscriber_id)
}

fn last_segment(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}
