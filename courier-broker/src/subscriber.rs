//! Queue consumer: provisions topology once, then long-polls its queue and
//! dispatches each decoded payload to a handler.
//!
//! Handler failures are never retried here. The message is simply not
//! deleted, so it becomes visible again once its visibility timeout lapses
//! and the queue's redrive policy moves it to the dead-letter queue after
//! `max_receive_count` deliveries. Messages that cannot be decoded are
//! deleted immediately.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queues::LONG_POLL_WAIT_SECONDS;
use crate::{
    envelope, BindReport, Broker, BrokerError, DeleteEntry, Delivery, QueueHandle, QueueRegistry,
    ReceivedMessage, SubscriptionBinder, TopicOptions,
};

pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
pub const DEFAULT_MAX_MESSAGES: i32 = 10;
const MAX_MESSAGES_LIMIT: i32 = 10;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback invoked once per decoded message.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery<T>) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(Delivery<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery<T>) -> Result<(), HandlerError> {
        (self.f)(delivery).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Queue name; doubles as the subscriber identity.
    pub subscriber_id: String,
    pub topics: Vec<String>,
    pub fifo: bool,
    /// When false the queue is read directly: no topic binding and no
    /// dead-letter queue. Used to drain `<id>_dlq` queues.
    pub dead_letter: bool,
    pub max_receive_count: u32,
    pub max_messages: i32,
    pub visibility_timeout_seconds: Option<u32>,
    pub require_all_bindings: bool,
}

impl SubscriberConfig {
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            topics: Vec::new(),
            fifo: false,
            dead_letter: true,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            max_messages: DEFAULT_MAX_MESSAGES,
            visibility_timeout_seconds: None,
            require_all_bindings: false,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn with_fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    pub fn with_max_messages(mut self, count: i32) -> Self {
        self.max_messages = count;
        self
    }

    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_require_all_bindings(mut self, required: bool) -> Self {
        self.require_all_bindings = required;
        self
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.subscriber_id.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "subscriber id is required".to_string(),
            ));
        }
        if self.subscriber_id.trim() != self.subscriber_id {
            return Err(BrokerError::Configuration(format!(
                "subscriber id {:?} has surrounding whitespace",
                self.subscriber_id
            )));
        }
        if self.dead_letter && self.topics.iter().all(|topic| topic.trim().is_empty()) {
            return Err(BrokerError::Configuration(format!(
                "subscriber {} has no topics to bind",
                self.subscriber_id
            )));
        }
        if self.max_receive_count == 0 {
            return Err(BrokerError::Configuration(
                "max receive count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn batch_size(&self) -> i32 {
        self.max_messages.clamp(1, MAX_MESSAGES_LIMIT)
    }

    fn topic_names(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|topic| topic.trim())
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Created,
    Provisioning,
    Polling,
    Processing,
    Terminated,
}

/// Topology resolved during provisioning.
#[derive(Debug)]
pub struct Provisioned {
    pub queue: QueueHandle,
    pub dead_letter_queue: Option<QueueHandle>,
    pub bindings: BindReport,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    pub handled: usize,
    pub retained: usize,
    pub dropped: usize,
}

/// Consumer bound to one payload type `T`.
pub struct Subscriber<T, H> {
    broker: Arc<dyn Broker>,
    config: SubscriberConfig,
    handler: H,
    state: watch::Sender<SubscriberState>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> Subscriber<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    pub fn new(broker: Arc<dyn Broker>, config: SubscriberConfig, handler: H) -> Self {
        let (state, _) = watch::channel(SubscriberState::Created);
        Self {
            broker,
            config,
            handler,
            state,
            _payload: PhantomData,
        }
    }

    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Ensures the queue, its dead-letter queue and the topic bindings.
    ///
    /// A failing topic binding is reported in [`Provisioned::bindings`] and
    /// only fails provisioning when `require_all_bindings` is set.
    pub async fn provision(&self) -> Result<Provisioned, BrokerError> {
        self.config.validate()?;
        self.set_state(SubscriberState::Provisioning);

        let queues = QueueRegistry::new(self.broker.clone())
            .with_visibility_timeout(self.config.visibility_timeout_seconds);
        let subscriber_id = self.config.subscriber_id.as_str();

        if !self.config.dead_letter {
            if !self.config.topic_names().is_empty() {
                warn!(
                    "Subscriber {} reads its queue directly; configured topics are not bound",
                    subscriber_id
                );
            }
            let name = QueueRegistry::queue_name(subscriber_id, self.config.fifo);
            let queue = queues
                .find_queue(&name)
                .await?
                .ok_or(BrokerError::QueueNotFound(name))?;
            return Ok(Provisioned {
                queue,
                dead_letter_queue: None,
                bindings: BindReport::default(),
            });
        }

        let queue = queues
            .ensure_queue(subscriber_id, self.config.fifo)
            .await
            .inspect_err(|err| error!("Error creating queue {}: {}", subscriber_id, err))?;
        let dead_letter_queue = queues
            .ensure_dead_letter_queue(subscriber_id, self.config.fifo)
            .await
            .inspect_err(|err| {
                error!(
                    "Error creating dead-letter queue for {}: {}",
                    subscriber_id, err
                )
            })?;

        let bindings = SubscriptionBinder::new(self.broker.clone())
            .bind_all(
                &queue,
                Some(&dead_letter_queue),
                &self.config.topic_names(),
                TopicOptions {
                    fifo: self.config.fifo,
                },
                self.config.max_receive_count,
            )
            .await;

        if !bindings.is_complete() {
            if self.config.require_all_bindings {
                return Err(BrokerError::BindingIncomplete(bindings.failed_topics()));
            }
            warn!(
                "Subscriber {} started without topics: {}",
                subscriber_id,
                bindings.failed_topics().join(", ")
            );
        }

        Ok(Provisioned {
            queue,
            dead_letter_queue: Some(dead_letter_queue),
            bindings,
        })
    }

    /// Provisions, then consumes until a receive call fails.
    pub async fn run(self) -> Result<(), BrokerError> {
        let result = self.provision_and_consume().await;
        self.set_state(SubscriberState::Terminated);
        result
    }

    /// Runs the subscriber on its own task. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<Result<(), BrokerError>> {
        tokio::spawn(self.run())
    }

    async fn provision_and_consume(&self) -> Result<(), BrokerError> {
        let provisioned = match self.provision().await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                error!("Error starting {}: {}", self.config.subscriber_id, err);
                return Err(err);
            }
        };

        info!(
            "Starting consumer {} on {} (topics: {})",
            self.config.subscriber_id,
            provisioned.queue.url,
            provisioned
                .bindings
                .bound
                .iter()
                .map(|topic| topic.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.consume(&provisioned.queue).await
    }

    async fn consume(&self, queue: &QueueHandle) -> Result<(), BrokerError> {
        loop {
            self.set_state(SubscriberState::Polling);
            let messages = match self
                .broker
                .receive_messages(&queue.url, self.config.batch_size(), LONG_POLL_WAIT_SECONDS)
                .await
            {
                Ok(messages) => messages,
                Err(err) => {
                    error!("Consumer {} stopped: {}", self.config.subscriber_id, err);
                    return Err(err);
                }
            };

            if messages.is_empty() {
                continue;
            }

            self.set_state(SubscriberState::Processing);
            let outcome = self.process_batch(queue, messages).await;
            debug!(
                "Consumer {} batch: {} handled, {} retained, {} dropped",
                self.config.subscriber_id, outcome.handled, outcome.retained, outcome.dropped
            );
        }
    }

    /// Handles one received batch and deletes every acknowledged message in a
    /// single batch call.
    pub(crate) async fn process_batch(
        &self,
        queue: &QueueHandle,
        messages: Vec<ReceivedMessage>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut acknowledged = Vec::with_capacity(messages.len());

        for message in messages {
            let payload = match envelope::decode::<T>(&message.body) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(
                        "Cannot decode message {} on {}; dropping it: {} (content: {})",
                        message.message_id, queue.name, err, message.body
                    );
                    outcome.dropped += 1;
                    acknowledged.push(DeleteEntry::from(&message));
                    continue;
                }
            };

            let delivery = Delivery {
                message_id: message.message_id.clone(),
                receive_count: message.receive_count,
                message_group_id: message.message_group_id.clone(),
                payload,
            };
            match self.handler.handle(delivery).await {
                Ok(()) => {
                    outcome.handled += 1;
                    acknowledged.push(DeleteEntry::from(&message));
                }
                Err(err) => {
                    warn!(
                        "Handler failed for message {} on {} (delivery {}): {}",
                        message.message_id, queue.name, message.receive_count, err
                    );
                    outcome.retained += 1;
                }
            }
        }

        if !acknowledged.is_empty() {
            self.acknowledge(queue, acknowledged).await;
        }
        outcome
    }

    async fn acknowledge(&self, queue: &QueueHandle, entries: Vec<DeleteEntry>) {
        match self.broker.delete_message_batch(&queue.url, entries).await {
            Ok(result) => {
                for (id, reason) in result.failed {
                    warn!(
                        "Message {} on {} was not deleted and will be redelivered: {}",
                        id, queue.name, reason
                    );
                }
            }
            Err(err) => error!(
                "Error deleting processed messages on {}; they will be redelivered: {}",
                queue.name, err
            ),
        }
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.send_replace(state);
    }
}
