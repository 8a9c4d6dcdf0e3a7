use std::collections::HashMap;

use uuid::Uuid;

use crate::BrokerError;

pub const FIFO_SUFFIX: &str = ".fifo";
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// Queue and topic attribute keys understood by the managed service.
pub mod attributes {
    pub const POLICY: &str = "Policy";
    pub const REDRIVE_POLICY: &str = "RedrivePolicy";
    pub const RECEIVE_MESSAGE_WAIT_TIME_SECONDS: &str = "ReceiveMessageWaitTimeSeconds";
    pub const VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
    pub const FIFO_QUEUE: &str = "FifoQueue";
    pub const FIFO_TOPIC: &str = "FifoTopic";
    pub const CONTENT_BASED_DEDUPLICATION: &str = "ContentBasedDeduplication";

    pub const MESSAGE_GROUP_ID: &str = "MessageGroupId";
    pub const MESSAGE_DEDUPLICATION_ID: &str = "MessageDeduplicationId";
}

/// Keys of the string attribute map accepted by [`PublishAttributes::from_map`].
pub const FIFO_KEY: &str = "Fifo";
pub const MESSAGE_GROUP_KEY: &str = "MessageGroupID";
pub const MESSAGE_DEDUPLICATION_KEY: &str = "MessageDeduplicationID";

/// Broker-side topic resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicHandle {
    pub name: String,
    pub arn: String,
}

/// Broker-side queue resource, addressed by its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicOptions {
    pub fifo: bool,
}

impl TopicOptions {
    pub fn fifo() -> Self {
        Self { fifo: true }
    }

    /// Name the topic is stored under on the broker.
    pub fn resource_name(&self, name: &str) -> String {
        with_fifo_suffix(name, self.fifo)
    }

    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        if self.fifo {
            attrs.insert(attributes::FIFO_TOPIC.to_string(), "true".to_string());
            attrs.insert(
                attributes::CONTENT_BASED_DEDUPLICATION.to_string(),
                "true".to_string(),
            );
        }
        attrs
    }
}

/// Ordering key and idempotency key for a FIFO publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoAttributes {
    pub message_group_id: String,
    pub message_deduplication_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishAttributes {
    pub fifo: Option<FifoAttributes>,
}

impl PublishAttributes {
    pub fn standard() -> Self {
        Self::default()
    }

    pub fn fifo(group_id: impl Into<String>, deduplication_id: impl Into<String>) -> Self {
        Self {
            fifo: Some(FifoAttributes {
                message_group_id: group_id.into(),
                message_deduplication_id: Some(deduplication_id.into()),
            }),
        }
    }

    /// FIFO attributes with freshly generated group and deduplication ids.
    pub fn fifo_random() -> Self {
        Self::fifo(Uuid::new_v4().to_string(), Uuid::new_v4().to_string())
    }

    /// Builds attributes from the `Fifo` / `MessageGroupID` /
    /// `MessageDeduplicationID` string map form.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, BrokerError> {
        let Some(raw) = map.get(FIFO_KEY) else {
            return Ok(Self::standard());
        };

        let fifo = parse_bool(raw).ok_or_else(|| BrokerError::InvalidAttribute {
            key: FIFO_KEY.to_string(),
            value: raw.clone(),
        })?;
        if !fifo {
            return Ok(Self::standard());
        }

        let group = map
            .get(MESSAGE_GROUP_KEY)
            .filter(|value| !value.is_empty())
            .ok_or(BrokerError::MissingMessageGroup)?;

        Ok(Self {
            fifo: Some(FifoAttributes {
                message_group_id: group.clone(),
                message_deduplication_id: map
                    .get(MESSAGE_DEDUPLICATION_KEY)
                    .filter(|value| !value.is_empty())
                    .cloned(),
            }),
        })
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo.is_some()
    }

    pub fn topic_options(&self) -> TopicOptions {
        TopicOptions {
            fifo: self.is_fifo(),
        }
    }
}

/// Request handed to [`crate::Broker::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishInput {
    pub topic_arn: String,
    pub message: String,
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
    pub message_attributes: HashMap<String, String>,
}

/// Message as returned by a queue receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Broker-maintained count of deliveries, including this one.
    pub receive_count: u32,
    pub message_group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl From<&ReceivedMessage> for DeleteEntry {
    fn from(message: &ReceivedMessage) -> Self {
        Self {
            id: message.message_id.clone(),
            receipt_handle: message.receipt_handle.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DeleteBatchOutcome {
    pub fn merge(&mut self, other: DeleteBatchOutcome) {
        self.successful.extend(other.successful);
        self.failed.extend(other.failed);
    }
}

/// Decoded message handed to a subscriber's handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub message_id: String,
    pub receive_count: u32,
    /// Set for FIFO queues. A failed delivery holds back the rest of its group.
    pub message_group_id: Option<String>,
    pub payload: T,
}

pub(crate) fn with_fifo_suffix(name: &str, fifo: bool) -> String {
    if fifo && !name.ends_with(FIFO_SUFFIX) {
        format!("{name}{FIFO_SUFFIX}")
    } else {
        name.to_string()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}
