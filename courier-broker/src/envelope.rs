use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Notification wrapper the topic puts around every published body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "MessageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "TopicArn", default, skip_serializing_if = "Option::is_none")]
    pub topic_arn: Option<String>,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn notification(
        message_id: impl Into<String>,
        topic_arn: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            kind: Some("Notification".to_string()),
            message_id: Some(message_id.into()),
            topic_arn: Some(topic_arn.into()),
            message: message.into(),
            timestamp: Some(timestamp.into()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed notification envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("payload does not match the expected shape: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Unwraps one envelope level and decodes the inner JSON as `T`.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, DecodeError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(DecodeError::Envelope)?;
    serde_json::from_str(&envelope.message).map_err(DecodeError::Payload)
}
