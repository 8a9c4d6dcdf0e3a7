use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid subscriber configuration: {0}")]
    Configuration(String),
    #[error("invalid value '{value}' for attribute {key}")]
    InvalidAttribute { key: String, value: String },
    #[error("FIFO publish requires a MessageGroupID")]
    MissingMessageGroup,
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unrecognized queue url: {0}")]
    UnrecognizedQueueUrl(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("failed to bind topics: {}", .0.join(", "))]
    BindingIncomplete(Vec<String>),
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl BrokerError {
    pub(crate) fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        BrokerError::Backend {
            operation,
            message: message.into(),
        }
    }
}
