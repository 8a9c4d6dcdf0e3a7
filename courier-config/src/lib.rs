use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use courier_models::errors::SendableError;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Publish to and consume from SNS/SQS topics", long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Aws,
    InMemory,
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, value_enum, default_value_t = Backend::Aws, global = true)]
    pub backend: Backend,

    #[arg(long, default_value = "us-east-1", global = true)]
    pub region: String,

    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Service endpoint override, e.g. a local emulator.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    #[arg(long, global = true)]
    pub credentials_file: Option<PathBuf>,

    /// Use static test credentials against `--endpoint`.
    #[arg(long, default_value_t = false, global = true)]
    pub fake: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Publish a JSON payload to one or more topics.
    Publish(PublishArgs),
    /// Ensure the queue, dead-letter queue and topic bindings exist.
    Provision(SubscriptionArgs),
    /// Run a consumer that logs every payload it receives.
    Subscribe(SubscriptionArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[arg(long = "topic", value_delimiter = ',', required = true)]
    pub topics: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub fifo: bool,

    #[arg(long)]
    pub group_id: Option<String>,

    #[arg(long)]
    pub deduplication_id: Option<String>,

    /// JSON document to publish.
    pub payload: String,
}

#[derive(Args, Debug, Clone)]
pub struct SubscriptionArgs {
    #[arg(long)]
    pub subscriber_id: String,

    #[arg(long = "topic", value_delimiter = ',', default_value = "")]
    pub topics: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub fifo: bool,

    /// Read the queue directly without binding topics or a dead-letter queue.
    #[arg(long, default_value_t = false)]
    pub no_dead_letter: bool,

    #[arg(long, default_value_t = 5)]
    pub max_receive_count: u32,

    #[arg(long, default_value_t = 10)]
    pub max_messages: i32,

    #[arg(long)]
    pub visibility_timeout_seconds: Option<u32>,

    #[arg(long, default_value_t = false)]
    pub require_all_bindings: bool,
}

impl SubscriptionArgs {
    pub fn topic_list(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|topic| topic.trim())
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub fn parse_config() -> Result<Config, SendableError> {
    Ok(Config::try_parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_accepts_comma_separated_topics() {
        let config = Config::try_parse_from([
            "courier",
            "publish",
            "--topic",
            "orders,invoices",
            r#"{"ping":"pong"}"#,
        ])
        .expect("valid arguments");

        match config.command {
            Command::Publish(args) => {
                assert_eq!(args.topics, vec!["orders", "invoices"]);
                assert!(!args.fifo);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(config.broker.backend, Backend::Aws);
        assert_eq!(config.broker.region, "us-east-1");
    }

    #[test]
    fn subscribe_defaults() {
        let config = Config::try_parse_from([
            "courier",
            "--backend",
            "in-memory",
            "subscribe",
            "--subscriber-id",
            "billing",
            "--topic",
            "orders",
        ])
        .expect("valid arguments");

        assert_eq!(config.broker.backend, Backend::InMemory);
        match config.command {
            Command::Subscribe(args) => {
                assert_eq!(args.subscriber_id, "billing");
                assert_eq!(args.topic_list(), vec!["orders"]);
                assert_eq!(args.max_receive_count, 5);
                assert!(!args.no_dead_letter);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn empty_topic_list_is_filtered() {
        let config = Config::try_parse_from([
            "courier",
            "subscribe",
            "--subscriber-id",
            "billing_dlq",
            "--no-dead-letter",
        ])
        .expect("valid arguments");

        match config.command {
            Command::Subscribe(args) => assert!(args.topic_list().is_empty()),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn subscriber_id_is_required() {
        assert!(Config::try_parse_from(["courier", "provision"]).is_err());
    }
}
