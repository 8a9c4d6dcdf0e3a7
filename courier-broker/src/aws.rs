//! [`Broker`] backed by the AWS topic and queue services.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_runtime::env_config::file::{EnvConfigFileKind, EnvConfigFiles};
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message, MessageSystemAttributeName, QueueAttributeName,
};
use log::{debug, info};

use crate::{Broker, BrokerError, DeleteBatchOutcome, DeleteEntry, PublishInput, ReceivedMessage};

const DEFAULT_REGION: &str = "us-east-1";
const DELETE_BATCH_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    pub region: Option<String>,
    pub profile: Option<String>,
    /// Override for both services, e.g. a local emulator.
    pub endpoint: Option<String>,
    pub credentials_file: Option<PathBuf>,
    /// Use static test credentials instead of the provider chain.
    pub fake: bool,
}

#[derive(Clone)]
pub struct AwsBroker {
    sns: aws_sdk_sns::Client,
    sqs: aws_sdk_sqs::Client,
}

impl AwsBroker {
    pub async fn connect(settings: &AwsSettings) -> Self {
        let explicit_region = settings
            .region
            .as_ref()
            .map(|name| Region::new(name.to_string()));
        let region_provider = RegionProviderChain::first_try(explicit_region)
            .or_default_provider()
            .or_else(DEFAULT_REGION);

        let mut loader =
            aws_config::defaults(BehaviorVersion::v2025_08_07()).region(region_provider);
        if let Some(profile) = &settings.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(path) = &settings.credentials_file {
            let files = EnvConfigFiles::builder()
                .include_default_config_file(true)
                .with_file(EnvConfigFileKind::Credentials, path)
                .build();
            loader = loader.profile_files(files);
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if settings.fake {
            loader = loader.credentials_provider(Credentials::new(
                "test", "test", None, None, "courier-fake",
            ));
        }
        let shared_config = loader.load().await;

        info!(
            "Connected to AWS in region {}",
            shared_config
                .region()
                .map(|region| region.as_ref())
                .unwrap_or(DEFAULT_REGION)
        );
        Self {
            sns: aws_sdk_sns::Client::new(&shared_config),
            sqs: aws_sdk_sqs::Client::new(&shared_config),
        }
    }
}

fn sdk_error<E>(operation: &'static str, err: E) -> BrokerError
where
    E: std::error::Error,
{
    BrokerError::backend(operation, DisplayErrorContext(&err).to_string())
}

fn missing(operation: &'static str, field: &str) -> BrokerError {
    BrokerError::backend(operation, format!("response is missing {field}"))
}

fn to_received(message: &Message) -> Result<ReceivedMessage, BrokerError> {
    let attributes = message.attributes();
    let system_attribute =
        |name: &MessageSystemAttributeName| attributes.and_then(|values| values.get(name));

    Ok(ReceivedMessage {
        message_id: message
            .message_id()
            .ok_or_else(|| missing("receive_message", "MessageId"))?
            .to_string(),
        receipt_handle: message
            .receipt_handle()
            .ok_or_else(|| missing("receive_message", "ReceiptHandle"))?
            .to_string(),
        body: message.body().unwrap_or_default().to_string(),
        receive_count: system_attribute(&MessageSystemAttributeName::ApproximateReceiveCount)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1),
        message_group_id: system_attribute(&MessageSystemAttributeName::MessageGroupId).cloned(),
    })
}

fn queue_attributes(attributes: HashMap<String, String>) -> HashMap<QueueAttributeName, String> {
    attributes
        .into_iter()
        .map(|(key, value)| (QueueAttributeName::from(key.as_str()), value))
        .collect()
}

#[async_trait]
impl Broker for AwsBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .sns
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| sdk_error("list_topics", err))?;
            arns.extend(
                output
                    .topics()
                    .iter()
                    .filter_map(|topic| topic.topic_arn().map(str::to_string)),
            );
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(arns)
    }

    async fn create_topic(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let output = self
            .sns
            .create_topic()
            .name(name)
            .set_attributes((!attributes.is_empty()).then_some(attributes))
            .send()
            .await
            .map_err(|err| sdk_error("create_topic", err))?;
        output
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| missing("create_topic", "TopicArn"))
    }

    async fn publish(&self, input: PublishInput) -> Result<String, BrokerError> {
        let mut request = self
            .sns
            .publish()
            .topic_arn(&input.topic_arn)
            .message(input.message)
            .set_message_group_id(input.message_group_id)
            .set_message_deduplication_id(input.message_deduplication_id);
        for (key, value) in input.message_attributes {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|err| sdk_error("publish", err))?;
            request = request.message_attributes(key, attribute);
        }

        let output = request
            .send()
            .await
            .map_err(|err| sdk_error("publish", err))?;
        let message_id = output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| missing("publish", "MessageId"))?;
        debug!("Published {} to {}", message_id, input.topic_arn);
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, BrokerError> {
        let output = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .send()
            .await
            .map_err(|err| sdk_error("subscribe", err))?;
        output
            .subscription_arn()
            .map(str::to_string)
            .ok_or_else(|| missing("subscribe", "SubscriptionArn"))
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut urls = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .sqs
                .list_queues()
                .queue_name_prefix(prefix)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| sdk_error("list_queues", err))?;
            urls.extend(output.queue_urls().iter().cloned());
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(urls)
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let output = self
            .sqs
            .create_queue()
            .queue_name(name)
            .set_attributes(Some(queue_attributes(attributes)))
            .send()
            .await
            .map_err(|err| sdk_error("create_queue", err))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| missing("create_queue", "QueueUrl"))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .set_attributes(Some(queue_attributes(attributes)))
            .send()
            .await
            .map_err(|err| sdk_error("set_queue_attributes", err))?;
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_system_attribute_names(MessageSystemAttributeName::MessageGroupId)
            .send()
            .await
            .map_err(|err| sdk_error("receive_message", err))?;
        output.messages().iter().map(to_received).collect()
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, BrokerError> {
        let mut outcome = DeleteBatchOutcome::default();
        for chunk in entries.chunks(DELETE_BATCH_LIMIT) {
            let request_entries = chunk
                .iter()
                .map(|entry| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(&entry.id)
                        .receipt_handle(&entry.receipt_handle)
                        .build()
                        .map_err(|err| sdk_error("delete_message_batch", err))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let output = self
                .sqs
                .delete_message_batch()
                .queue_url(queue_url)
                .set_entries(Some(request_entries))
                .send()
                .await
                .map_err(|err| sdk_error("delete_message_batch", err))?;

            outcome.merge(DeleteBatchOutcome {
                successful: output
                    .successful()
                    .iter()
                    .map(|entry| entry.id().to_string())
                    .collect(),
                failed: output
                    .failed()
                    .iter()
                    .map(|entry| {
                        let reason = entry.message().unwrap_or(entry.code());
                        (entry.id().to_string(), reason.to_string())
                    })
                    .collect(),
            });
        }
        Ok(outcome)
    }
}
