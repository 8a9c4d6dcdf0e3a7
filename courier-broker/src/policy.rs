use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::BrokerError;

const POLICY_VERSION: &str = "2012-10-17";
const SEND_MESSAGE_ACTION: &str = "SQS:SendMessage";
const SOURCE_ARN_CONDITION: &str = "aws:SourceArn";

/// Access policy letting each topic in `topic_arns` send into the queue.
pub fn access_policy(queue_arn: &str, topic_arns: &[String]) -> String {
    let statements: Vec<Value> = topic_arns
        .iter()
        .enumerate()
        .map(|(index, topic_arn)| {
            json!({
                "Sid": format!("topic-{index}"),
                "Effect": "Allow",
                "Principal": { "AWS": "*" },
                "Action": SEND_MESSAGE_ACTION,
                "Resource": queue_arn,
                "Condition": {
                    "ArnEquals": { "aws:SourceArn": topic_arn }
                }
            })
        })
        .collect();

    json!({
        "Version": POLICY_VERSION,
        "Id": format!("{queue_arn}/SQSDefaultPolicy"),
        "Statement": statements,
    })
    .to_string()
}

/// Whether `policy` grants `source_arn` permission to send into the queue.
pub fn policy_allows(policy: &str, source_arn: &str) -> bool {
    let Ok(document) = serde_json::from_str::<Value>(policy) else {
        return false;
    };

    let statements = match document.get("Statement") {
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => return false,
    };

    statements.into_iter().any(|statement| {
        statement.get("Effect").and_then(Value::as_str) == Some("Allow")
            && grants_send(statement.get("Action"))
            && condition_matches(statement, source_arn)
    })
}

fn grants_send(action: Option<&Value>) -> bool {
    let matches = |value: &Value| {
        value
            .as_str()
            .map(|action| {
                action.eq_ignore_ascii_case(SEND_MESSAGE_ACTION)
                    || action == "*"
                    || action.eq_ignore_ascii_case("SQS:*")
            })
            .unwrap_or(false)
    };
    match action {
        Some(Value::Array(actions)) => actions.iter().any(matches),
        Some(value) => matches(value),
        None => false,
    }
}

fn condition_matches(statement: &Value, source_arn: &str) -> bool {
    let Some(condition) = statement.get("Condition") else {
        return true;
    };
    match condition
        .get("ArnEquals")
        .and_then(|arn_equals| arn_equals.get(SOURCE_ARN_CONDITION))
    {
        Some(Value::String(arn)) => arn == source_arn,
        Some(Value::Array(arns)) => arns.iter().any(|arn| arn.as_str() == Some(source_arn)),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    #[serde(with = "count_as_string")]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(dead_letter_target_arn: impl Into<String>, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: dead_letter_target_arn.into(),
            max_receive_count,
        }
    }

    pub fn to_json(&self) -> Result<String, BrokerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, BrokerError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// The service writes the count as a string but accepts either form.
mod count_as_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(raw) => raw.parse().map_err(D::Error::custom),
            Value::Number(number) => number
                .as_u64()
                .and_then(|count| u32::try_from(count).ok())
                .ok_or_else(|| D::Error::custom("maxReceiveCount out of range")),
            other => Err(D::Error::custom(format!(
                "unexpected maxReceiveCount {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "arn:aws:sqs:us-east-1:000000000000:billing";
    const ORDERS: &str = "arn:aws:sns:us-east-1:000000000000:orders";
    const REFUNDS: &str = "arn:aws:sns:us-east-1:000000000000:refunds";

    #[test]
    fn access_policy_grants_each_topic() {
        let policy = access_policy(QUEUE, &[ORDERS.to_string(), REFUNDS.to_string()]);
        let document: Value = serde_json::from_str(&policy).unwrap();

        assert_eq!(document["Version"], "2012-10-17");
        assert_eq!(document["Statement"].as_array().unwrap().len(), 2);
        assert_eq!(document["Statement"][0]["Resource"], QUEUE);
        assert_eq!(document["Statement"][0]["Principal"]["AWS"], "*");
        assert!(policy_allows(&policy, ORDERS));
        assert!(policy_allows(&policy, REFUNDS));
    }

    #[test]
    fn access_policy_rejects_other_sources() {
        let policy = access_policy(QUEUE, &[ORDERS.to_string()]);
        assert!(!policy_allows(&policy, REFUNDS));
        assert!(!policy_allows("not json", ORDERS));
    }

    #[test]
    fn policy_with_source_list_is_understood() {
        let policy = json!({
            "Statement": {
                "Effect": "Allow",
                "Action": ["sqs:SendMessage"],
                "Condition": { "ArnEquals": { "aws:SourceArn": [ORDERS, REFUNDS] } }
            }
        })
        .to_string();
        assert!(policy_allows(&policy, REFUNDS));
    }

    #[test]
    fn redrive_policy_document_shape() {
        let json = RedrivePolicy::new("arn:aws:sqs:us-east-1:000000000000:billing_dlq", 3)
            .to_json()
            .unwrap();
        let document: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            document,
            json!({
                "deadLetterTargetArn": "arn:aws:sqs:us-east-1:000000000000:billing_dlq",
                "maxReceiveCount": "3"
            })
        );
    }

    #[test]
    fn redrive_policy_accepts_numeric_count() {
        let policy =
            RedrivePolicy::from_json(r#"{"deadLetterTargetArn":"arn:x","maxReceiveCount":4}"#)
                .unwrap();
        assert_eq!(policy.max_receive_count, 4);
    }
}
