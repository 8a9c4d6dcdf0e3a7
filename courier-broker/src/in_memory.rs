//! In-process emulation of the managed topic/queue service.
//!
//! Queues are addressed by local-endpoint URLs
//! (`http://localhost:4566/000000000000/<name>`) and topics by
//! `arn:aws:sns:us-east-1:000000000000:<name>`, so the ARN rewriting and
//! policy documents used against the real service are exercised unchanged.

use crate::{
    arn::{self, LOCAL_REGION},
    attributes,
    envelope::Envelope,
    policy::{self, RedrivePolicy},
    Broker, BrokerError, DeleteBatchOutcome, DeleteEntry, PublishInput, ReceivedMessage,
    FIFO_SUFFIX,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

pub const ACCOUNT_ID: &str = "000000000000";
pub const LOCAL_ENDPOINT: &str = "http://localhost:4566";

const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u64 = 30;
const MAX_RECEIVE_BATCH: usize = 10;
const MAX_QUEUE_NAME_LEN: usize = 80;
const MAX_TOPIC_NAME_LEN: usize = 256;

/// Failure injected into the next matching calls until cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Publish { topic: String },
    Subscribe { topic: String },
    CreateQueue { name: String },
    Receive,
}

struct TopicState {
    name: String,
    arn: String,
    fifo: bool,
    content_based_deduplication: bool,
    /// (endpoint queue ARN, subscription ARN)
    subscriptions: Vec<(String, String)>,
    seen_deduplication_ids: HashSet<String>,
}

struct StoredMessage {
    message_id: String,
    body: String,
    group_id: Option<String>,
    receive_count: u32,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn new(body: String, group_id: Option<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            group_id,
            receive_count: 0,
            receipt_handle: None,
            invisible_until: None,
        }
    }
}

struct QueueState {
    name: String,
    url: String,
    arn: String,
    fifo: bool,
    attributes: HashMap<String, String>,
    messages: VecDeque<StoredMessage>,
}

impl QueueState {
    fn visibility_timeout(&self) -> Duration {
        let seconds = self
            .attributes
            .get(attributes::VISIBILITY_TIMEOUT)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECONDS);
        Duration::from_secs(seconds)
    }

    fn redrive_policy(&self) -> Option<RedrivePolicy> {
        let raw = self.attributes.get(attributes::REDRIVE_POLICY)?;
        match RedrivePolicy::from_json(raw) {
            Ok(policy) => Some(policy),
            Err(err) => {
                warn!("Ignoring unreadable redrive policy on {}: {}", self.name, err);
                None
            }
        }
    }

    fn accepts_from(&self, topic_arn: &str) -> bool {
        self.attributes
            .get(attributes::POLICY)
            .map(|document| policy::policy_allows(document, topic_arn))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicState>,
    queues: BTreeMap<String, QueueState>,
    faults: Vec<Fault>,
    delete_batches: Vec<Vec<String>>,
}

impl BrokerState {
    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn topic_by_arn(&mut self, topic_arn: &str) -> Result<&mut TopicState, BrokerError> {
        self.topics
            .get_mut(arn::resource_name(topic_arn))
            .filter(|topic| topic.arn == topic_arn)
            .ok_or_else(|| BrokerError::TopicNotFound(topic_arn.to_string()))
    }

    fn queue_by_url(&mut self, queue_url: &str) -> Result<&mut QueueState, BrokerError> {
        queue_name_from_url(queue_url)
            .and_then(|name| self.queues.get_mut(name))
            .ok_or_else(|| BrokerError::QueueNotFound(queue_url.to_string()))
    }
}

struct Taken {
    messages: Vec<ReceivedMessage>,
    next_visible: Option<Instant>,
    redriven: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_url(name: &str) -> String {
        format!("{LOCAL_ENDPOINT}/{ACCOUNT_ID}/{name}")
    }

    pub fn topic_arn(name: &str) -> String {
        format!("arn:aws:sns:{LOCAL_REGION}:{ACCOUNT_ID}:{name}")
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Messages stored in the queue, in flight or not.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.state.lock().topics.keys().cloned().collect()
    }

    pub fn queue_attributes(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.attributes.clone())
    }

    /// Queue ARNs subscribed to the named topic.
    pub fn subscriptions(&self, topic_name: &str) -> Vec<String> {
        self.state
            .lock()
            .topics
            .get(topic_name)
            .map(|topic| {
                topic
                    .subscriptions
                    .iter()
                    .map(|(endpoint, _)| endpoint.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entry ids of every delete-batch call, in call order.
    pub fn delete_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().delete_batches.clone()
    }

    /// Enqueue a raw body directly, bypassing topics and envelopes.
    pub fn send_raw(&self, queue_name: &str, body: &str) -> Result<String, BrokerError> {
        let message_id = {
            let mut guard = self.state.lock();
            let queue = guard
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;
            let group_id = queue.fifo.then(|| "raw".to_string());
            let message = StoredMessage::new(body.to_string(), group_id);
            let message_id = message.message_id.clone();
            queue.messages.push_back(message);
            message_id
        };
        self.notify.notify_waiters();
        Ok(message_id)
    }

    fn take_visible(&self, queue_url: &str, max: usize) -> Result<Taken, BrokerError> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let queue = guard.queue_by_url(queue_url)?;

        let fifo = queue.fifo;
        let visibility = queue.visibility_timeout();
        let redrive = queue.redrive_policy();

        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut selected = Vec::new();
        let mut dead_lettered = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut index = 0;

        while index < queue.messages.len() && selected.len() < max {
            let message = &mut queue.messages[index];

            if let Some(until) = message.invisible_until.filter(|until| *until > now) {
                next_visible = Some(next_visible.map_or(until, |current| current.min(until)));
                if fifo {
                    if let Some(group) = &message.group_id {
                        blocked_groups.insert(group.clone());
                    }
                }
                index += 1;
                continue;
            }

            if fifo
                && message
                    .group_id
                    .as_ref()
                    .is_some_and(|group| blocked_groups.contains(group))
            {
                index += 1;
                continue;
            }

            if let Some(policy) = &redrive {
                if message.receive_count >= policy.max_receive_count {
                    if let Some(expired) = queue.messages.remove(index) {
                        dead_lettered.push(expired);
                    }
                    continue;
                }
            }

            let receipt_handle = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.receipt_handle = Some(receipt_handle.clone());
            message.invisible_until = Some(now + visibility);

            selected.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                receipt_handle,
                body: message.body.clone(),
                receive_count: message.receive_count,
                message_group_id: message.group_id.clone(),
            });
            index += 1;
        }

        let redriven = !dead_lettered.is_empty();
        if let (true, Some(policy)) = (redriven, redrive) {
            let source = queue.name.clone();
            let target = arn::resource_name(&policy.dead_letter_target_arn).to_string();
            match guard.queues.get_mut(&target) {
                Some(dead_letter_queue) => {
                    for mut message in dead_lettered {
                        debug!(
                            "Moving message {} from {} to {}",
                            message.message_id, source, target
                        );
                        message.receive_count = 0;
                        message.receipt_handle = None;
                        message.invisible_until = None;
                        dead_letter_queue.messages.push_back(message);
                    }
                }
                None => warn!(
                    "Dead-letter queue {} for {} does not exist; dropping {} message(s)",
                    target,
                    source,
                    dead_lettered.len()
                ),
            }
        }

        Ok(Taken {
            messages: selected,
            next_visible,
            redriven,
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let guard = self.state.lock();
        Ok(guard.topics.values().map(|topic| topic.arn.clone()).collect())
    }

    async fn create_topic(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let fifo = flag(&attributes, attributes::FIFO_TOPIC);
        validate_name("create_topic", name, fifo, MAX_TOPIC_NAME_LEN)?;

        let mut guard = self.state.lock();
        if let Some(existing) = guard.topics.get(name) {
            return Ok(existing.arn.clone());
        }

        let arn = Self::topic_arn(name);
        guard.topics.insert(
            name.to_string(),
            TopicState {
                name: name.to_string(),
                arn: arn.clone(),
                fifo,
                content_based_deduplication: flag(
                    &attributes,
                    attributes::CONTENT_BASED_DEDUPLICATION,
                ),
                subscriptions: Vec::new(),
                seen_deduplication_ids: HashSet::new(),
            },
        );
        debug!("Created topic {}", arn);
        Ok(arn)
    }

    async fn publish(&self, input: PublishInput) -> Result<String, BrokerError> {
        let message_id = Uuid::new_v4().to_string();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let topic = state.topic_by_arn(&input.topic_arn)?;
        let topic_name = topic.name.clone();
        if state.has_fault(&Fault::Publish {
            topic: topic_name.clone(),
        }) {
            return Err(BrokerError::backend("publish", "injected fault"));
        }

        let topic = state.topic_by_arn(&input.topic_arn)?;
        let group_id = if topic.fifo {
            let group_id = input.message_group_id.clone().ok_or_else(|| {
                BrokerError::backend("publish", "MessageGroupId is required for FIFO topics")
            })?;
            let deduplication_id = match (
                &input.message_deduplication_id,
                topic.content_based_deduplication,
            ) {
                (Some(id), _) => id.clone(),
                (None, true) => content_hash(&input.message),
                (None, false) => {
                    return Err(BrokerError::backend(
                        "publish",
                        "MessageDeduplicationId is required without content-based deduplication",
                    ))
                }
            };
            if !topic.seen_deduplication_ids.insert(deduplication_id.clone()) {
                debug!(
                    "Suppressing duplicate {} on {}",
                    deduplication_id, topic.arn
                );
                return Ok(message_id);
            }
            Some(group_id)
        } else {
            None
        };

        let topic_arn = topic.arn.clone();
        let endpoints: Vec<String> = topic
            .subscriptions
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect();

        let body = Envelope::notification(
            message_id.clone(),
            topic_arn.clone(),
            input.message,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .to_json()?;

        for endpoint in endpoints {
            let Some(queue) = state.queues.get_mut(arn::resource_name(&endpoint)) else {
                warn!("Subscription endpoint {} no longer exists", endpoint);
                continue;
            };
            if !queue.accepts_from(&topic_arn) {
                debug!(
                    "Queue {} policy does not allow {}; message dropped",
                    queue.name, topic_arn
                );
                continue;
            }
            queue
                .messages
                .push_back(StoredMessage::new(body.clone(), group_id.clone()));
        }

        drop(guard);
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, BrokerError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let topic_name = state.topic_by_arn(topic_arn)?.name.clone();
        if state.has_fault(&Fault::Subscribe { topic: topic_name }) {
            return Err(BrokerError::backend("subscribe", "injected fault"));
        }
        if protocol != "sqs" {
            return Err(BrokerError::backend(
                "subscribe",
                format!("unsupported protocol {protocol}"),
            ));
        }

        let queue_fifo = state
            .queues
            .get(arn::resource_name(endpoint))
            .filter(|queue| queue.arn == endpoint)
            .map(|queue| queue.fifo)
            .ok_or_else(|| BrokerError::QueueNotFound(endpoint.to_string()))?;

        let topic = state.topic_by_arn(topic_arn)?;
        if topic.fifo != queue_fifo {
            return Err(BrokerError::backend(
                "subscribe",
                format!("FIFO mismatch between {topic_arn} and {endpoint}"),
            ));
        }

        if let Some((_, subscription_arn)) = topic
            .subscriptions
            .iter()
            .find(|(existing, _)| existing == endpoint)
        {
            return Ok(subscription_arn.clone());
        }

        let subscription_arn = format!("{topic_arn}:{}", Uuid::new_v4());
        topic
            .subscriptions
            .push((endpoint.to_string(), subscription_arn.clone()));
        Ok(subscription_arn)
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let guard = self.state.lock();
        Ok(guard
            .queues
            .values()
            .filter(|queue| queue.name.starts_with(prefix))
            .map(|queue| queue.url.clone())
            .collect())
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let fifo = flag(&attributes, attributes::FIFO_QUEUE);
        validate_name("create_queue", name, fifo, MAX_QUEUE_NAME_LEN)?;

        let mut guard = self.state.lock();
        if guard.has_fault(&Fault::CreateQueue {
            name: name.to_string(),
        }) {
            return Err(BrokerError::backend("create_queue", "injected fault"));
        }
        if let Some(existing) = guard.queues.get(name) {
            return Ok(existing.url.clone());
        }

        let url = Self::queue_url(name);
        let arn = arn::queue_url_to_arn(&url)?;
        guard.queues.insert(
            name.to_string(),
            QueueState {
                name: name.to_string(),
                url: url.clone(),
                arn,
                fifo,
                attributes,
                messages: VecDeque::new(),
            },
        );
        debug!("Created queue {}", url);
        Ok(url)
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let queue = guard.queue_by_url(queue_url)?;
        queue.attributes.extend(attributes);
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        if self.state.lock().has_fault(&Fault::Receive) {
            return Err(BrokerError::backend("receive_message", "injected fault"));
        }

        let max = usize::try_from(max_messages)
            .unwrap_or(1)
            .clamp(1, MAX_RECEIVE_BATCH);
        let wait = Duration::from_secs(u64::try_from(wait_time_seconds).unwrap_or(0));
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = self.take_visible(queue_url, max)?;
            if taken.redriven {
                self.notify.notify_waiters();
            }
            if !taken.messages.is_empty() {
                return Ok(taken.messages);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake = taken
                .next_visible
                .map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, BrokerError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .delete_batches
            .push(entries.iter().map(|entry| entry.id.clone()).collect());

        let queue = state.queue_by_url(queue_url)?;
        let mut outcome = DeleteBatchOutcome::default();
        for entry in entries {
            let position = queue.messages.iter().position(|message| {
                message.receipt_handle.as_deref() == Some(entry.receipt_handle.as_str())
            });
            match position {
                Some(index) => {
                    queue.messages.remove(index);
                    outcome.successful.push(entry.id);
                }
                None => outcome
                    .failed
                    .push((entry.id, "ReceiptHandleIsInvalid".to_string())),
            }
        }
        Ok(outcome)
    }
}

fn queue_name_from_url(queue_url: &str) -> Option<&str> {
    queue_url
        .strip_prefix(LOCAL_ENDPOINT)?
        .strip_prefix('/')?
        .strip_prefix(ACCOUNT_ID)?
        .strip_prefix('/')
}

fn flag(attributes: &HashMap<String, String>, key: &str) -> bool {
    attributes
        .get(key)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn validate_name(
    operation: &'static str,
    name: &str,
    fifo: bool,
    max_len: usize,
) -> Result<(), BrokerError> {
    let base = match (fifo, name.strip_suffix(FIFO_SUFFIX)) {
        (true, Some(base)) => base,
        (true, None) => {
            return Err(BrokerError::backend(
                operation,
                format!("FIFO resource name must end with {FIFO_SUFFIX}: {name}"),
            ))
        }
        (false, _) => name,
    };

    let valid_chars = base
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if base.is_empty() || name.len() > max_len || !valid_chars {
        return Err(BrokerError::backend(
            operation,
            format!("invalid resource name: {name}"),
        ));
    }
    Ok(())
}

fn content_hash(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
