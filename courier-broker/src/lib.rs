pub mod arn;
pub mod aws;
pub mod binder;
pub mod envelope;
mod errors;
pub mod in_memory;
pub mod policy;
pub mod producer;
pub mod queues;
pub mod subscriber;
pub mod topics;
mod types;

pub use binder::{BindReport, SubscriptionBinder};
pub use errors::BrokerError;
pub use producer::{FanOutReport, Producer};
pub use queues::QueueRegistry;
pub use subscriber::{
    handler_fn, HandlerError, MessageHandler, Provisioned, Subscriber, SubscriberConfig,
    SubscriberState,
};
pub use topics::TopicRegistry;
pub use types::{
    attributes, DeleteBatchOutcome, DeleteEntry, Delivery, FifoAttributes, PublishAttributes,
    PublishInput, QueueHandle, ReceivedMessage, TopicHandle, TopicOptions, DEAD_LETTER_SUFFIX,
    FIFO_SUFFIX,
};

use std::collections::HashMap;

use async_trait::async_trait;

/// Operations invoked on the managed topic/queue service.
///
/// Listing calls return every page; implementations follow continuation
/// tokens themselves.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// ARNs of every topic visible to the caller.
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    /// Create a topic, returning its ARN.
    async fn create_topic(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>;

    /// Publish to a topic, returning the broker-assigned message id.
    async fn publish(&self, input: PublishInput) -> Result<String, BrokerError>;

    /// Subscribe `endpoint` to the topic, returning the subscription ARN.
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, BrokerError>;

    /// URLs of queues whose name starts with `prefix`.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    /// Create a queue, returning its URL.
    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), BrokerError>;

    /// Long-poll receive of up to `max_messages` messages.
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, BrokerError>;
}
