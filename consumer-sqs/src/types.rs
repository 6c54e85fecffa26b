use std::collections::HashMap;

use aws_sdk_sqs::types::{
    Message as SQSMessage, MessageAttributeValue, MessageSystemAttributeName,
};
use conveyor_helpers::consumers::{DeliveryInfo, Message};
use serde::{Deserialize, Serialize};

/// A lightweight structure for holding the message ID and receipt handle
/// used to identify an SQS message in operations like delete
/// and changing the visibility timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
}

impl From<SQSMessage> for MessageHandle {
    fn from(message: SQSMessage) -> Self {
        MessageHandle {
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
        }
    }
}

/// Metadata for a message received from an SQS queue.
#[derive(Debug, Clone, Default)]
pub struct SQSMessageMetadata {
    /// An identifier associated with the act of receiving the message.
    /// A new receipt handle is returned every time you receive a message.
    /// When deleting a message, you provide the last received receipt handle
    /// to delete the message.
    pub receipt_handle: Option<String>,
    /// A map of the message system attributes requested on receive to their
    /// respective values, including `ApproximateReceiveCount` which the
    /// consumer runtime uses to derive per-delivery retry information.
    pub attributes: Option<HashMap<MessageSystemAttributeName, String>>,
    /// An MD5 digest of the non-URL-encoded message attribute string.
    /// You can use this attribute to verify that Amazon SQS received the
    /// message correctly.
    pub md5_of_message_attributes: Option<String>,
    /// Each message attribute consists of a `Name`, `Type`, and `Value`.
    pub message_attributes: Option<HashMap<String, MessageAttributeValue>>,
    /// The data of an embedded SNS message in the body of the SQS message.
    /// This is only present if the SQS message body is an SNS message.
    /// The body set for the primary message is set to the body of the embedded
    /// SNS message, this should be used to get access to the full SNS message.
    pub sns_data: Option<SNSMessage>,
}

/// An SNS notification envelope that was delivered through an SQS
/// subscription without raw message delivery enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SNSMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "SignatureVersion")]
    pub signature_version: String,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "UnsubscribeURL")]
    pub unsubscribe_url: String,
    #[serde(rename = "MessageAttributes")]
    pub message_attributes: Option<HashMap<String, SNSMessageAttribute>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SNSMessageAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

pub trait ToMessageHandle {
    fn to_message_handle(&self) -> MessageHandle;
}

impl ToMessageHandle for Message<SQSMessageMetadata> {
    fn to_message_handle(&self) -> MessageHandle {
        MessageHandle {
            message_id: Some(self.message_id.clone()),
            receipt_handle: self.metadata.receipt_handle.clone(),
        }
    }
}

pub trait FromSQSMessage {
    fn from_sqs_message(message: SQSMessage) -> Self;
}

impl FromSQSMessage for Message<SQSMessageMetadata> {
    fn from_sqs_message(message: SQSMessage) -> Self {
        let (sns_message, body) =
            match serde_json::from_str::<SNSMessage>(&message.body.clone().unwrap_or_default()) {
                Ok(sns_message) => {
                    let sns_message_body = sns_message.message.clone();
                    (Some(sns_message), Some(sns_message_body))
                }
                Err(_) => (None, message.body),
            };

        Message {
            message_id: message.message_id.unwrap_or_default(),
            body,
            md5_of_body: message.md5_of_body,
            metadata: SQSMessageMetadata {
                receipt_handle: message.receipt_handle,
                attributes: message.attributes,
                md5_of_message_attributes: message.md5_of_message_attributes,
                message_attributes: message.message_attributes,
                sns_data: sns_message,
            },
        }
    }
}

/// Derives per-delivery retry information from the receive count
/// attribute maintained by SQS.
///
/// `retry_count` is 0 when SQS did not report a count; `is_last_attempt`
/// is only ever true when a maximum receive count is configured.
pub fn delivery_info(
    metadata: &SQSMessageMetadata,
    max_receive_count: Option<u32>,
) -> DeliveryInfo {
    let retry_count = metadata
        .attributes
        .as_ref()
        .and_then(|attributes| {
            attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
        })
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(0);

    let is_last_attempt =
        max_receive_count.map_or(false, |max_receive_count| retry_count >= max_receive_count);

    DeliveryInfo {
        retry_count,
        is_last_attempt,
    }
}
