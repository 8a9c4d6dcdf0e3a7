//! Queue URL to queue ARN rewriting.
//!
//! Two URL shapes are recognised:
//!
//! * production: `https://sqs.<region>.amazonaws.com/<account>/<queue>`
//! * local endpoint: `http://<host>:<port>/<account>/<queue>` (emulators such
//!   as LocalStack), which carries no region, so [`LOCAL_REGION`] is used.

use crate::BrokerError;

pub const SQS_ARN_PREFIX: &str = "arn:aws:sqs:";
pub const LOCAL_REGION: &str = "us-east-1";

const PRODUCTION_HOST_PREFIX: &str = "https://sqs.";
const PRODUCTION_DOMAIN: &str = ".amazonaws.com/";

pub fn queue_url_to_arn(queue_url: &str) -> Result<String, BrokerError> {
    if let Some(arn) = production_arn(queue_url) {
        return Ok(arn);
    }
    if let Some(arn) = local_arn(queue_url) {
        return Ok(arn);
    }
    Err(BrokerError::UnrecognizedQueueUrl(queue_url.to_string()))
}

/// Last `:`-separated segment of an ARN, i.e. the resource name.
pub fn resource_name(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}

fn production_arn(queue_url: &str) -> Option<String> {
    let rest = queue_url.strip_prefix(PRODUCTION_HOST_PREFIX)?;
    let (region, path) = rest.split_once(PRODUCTION_DOMAIN)?;
    if region.is_empty() || region.contains('/') {
        return None;
    }
    Some(format!(
        "{SQS_ARN_PREFIX}{region}:{}",
        account_and_queue(path)?
    ))
}

fn local_arn(queue_url: &str) -> Option<String> {
    let rest = queue_url
        .strip_prefix("http://")
        .or_else(|| queue_url.strip_prefix("https://"))?;
    let (host, path) = rest.split_once('/')?;
    if host.is_empty() || host.contains(PRODUCTION_DOMAIN.trim_end_matches('/')) {
        return None;
    }
    Some(format!(
        "{SQS_ARN_PREFIX}{LOCAL_REGION}:{}",
        account_and_queue(path)?
    ))
}

fn account_and_queue(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        [account, queue] if !account.is_empty() && !queue.is_empty() => {
            Some(format!("{account}:{queue}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURES: &[(&str, &str)] = &[
        (
            "https://sqs.us-east-1.amazonaws.com/123456789012/orders",
            "arn:aws:sqs:us-east-1:123456789012:orders",
        ),
        (
            "https://sqs.sa-east-1.amazonaws.com/123456789012/orders_dlq",
            "arn:aws:sqs:sa-east-1:123456789012:orders_dlq",
        ),
        (
            "https://sqs.eu-west-2.amazonaws.com/123456789012/payments.fifo",
            "arn:aws:sqs:eu-west-2:123456789012:payments.fifo",
        ),
        (
            "http://localhost:4566/000000000000/orders",
            "arn:aws:sqs:us-east-1:000000000000:orders",
        ),
        (
            "http://127.0.0.1:9324/000000000000/orders_dlq",
            "arn:aws:sqs:us-east-1:000000000000:orders_dlq",
        ),
        (
            "http://sqs.us-east-1.localhost.localstack.cloud:4566/000000000000/a.fifo",
            "arn:aws:sqs:us-east-1:000000000000:a.fifo",
        ),
    ];

    #[test]
    fn rewrites_every_supported_shape() {
        for (url, expected) in FIXTURES {
            assert_eq!(queue_url_to_arn(url).unwrap(), *expected, "url {url}");
        }
    }

    #[test]
    fn rejects_unknown_shapes() {
        for url in [
            "orders",
            "ftp://localhost:21/000000000000/orders",
            "http://localhost:4566/orders",
            "https://sqs.us-east-1.amazonaws.com/123456789012/",
            "https://sqs.us-east-1.amazonaws.com/a/b/c",
        ] {
            assert!(
                matches!(
                    queue_url_to_arn(url),
                    Err(BrokerError::UnrecognizedQueueUrl(_))
                ),
                "url {url}"
            );
        }
    }

    #[test]
    fn resource_name_is_last_segment() {
        assert_eq!(
            resource_name("arn:aws:sns:us-east-1:000000000000:orders.fifo"),
            "orders.fifo"
        );
        assert_eq!(resource_name("orders"), "orders");
    }
}
