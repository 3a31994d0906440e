use std::ops::Range;

use async_trait::async_trait;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sns::types::{MessageAttributeValue as SnsAttribute, PublishBatchRequestEntry};
use aws_sdk_sqs::Client as SqsClient;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageAttributeValue as SqsAttribute, SendMessageBatchRequestEntry};
use tracing::{debug, instrument, warn};

use super::{Message, Publisher};
use crate::error::PublishError;

/// Topics with this prefix are SNS topic ARNs, anything else is an SQS queue URL.
pub const SNS_PREFIX: &str = "SNS::";

/// Entry limit of `SendMessageBatch` and `PublishBatch`.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Aggregate payload limit of one `SendMessageBatch` or `PublishBatch` request.
pub const MAX_BATCH_BYTES: usize = 256 * 1024;

/// Attribute limit per message on both services.
const MAX_ATTRIBUTES: usize = 10;

const ATTRIBUTE_TYPE: &str = "String";

/// FIFO queue URLs and topic ARNs end with this.
const FIFO_SUFFIX: &str = ".fifo";

/// Where a topic string routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel<'a> {
    Sqs { queue_url: &'a str },
    Sns { topic_arn: &'a str },
}

impl<'a> Channel<'a> {
    pub fn parse(topic: &'a str) -> Self {
        match topic.strip_prefix(SNS_PREFIX) {
            Some(topic_arn) => Self::Sns { topic_arn },
            None => Self::Sqs { queue_url: topic },
        }
    }

    /// FIFO channels need a group id and a deduplication id on every message.
    pub fn is_fifo(&self) -> bool {
        match self {
            Self::Sqs { queue_url } => queue_url.ends_with(FIFO_SUFFIX),
            Self::Sns { topic_arn } => topic_arn.ends_with(FIFO_SUFFIX),
        }
    }
}

/// Bytes a message counts against [`MAX_BATCH_BYTES`]: body plus attribute
/// names, types and values.
pub fn encoded_size(message: &Message<'_>) -> usize {
    let attributes: usize = message
        .attributes()
        .iter()
        .take(MAX_ATTRIBUTES)
        .map(|(name, value)| name.len() + ATTRIBUTE_TYPE.len() + value.len())
        .sum();
    message.payload.len() + attributes
}

/// Splits messages into runs of consecutive same-topic messages that fit one
/// batch call, both by entry count and by aggregate size.
///
/// A message too large on its own still gets a chunk of its own, so only
/// that message is rejected.
pub fn plan_chunks(messages: &[Message<'_>]) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (index, message) in messages.iter().enumerate() {
        let size = encoded_size(message);
        let full = index > start
            && (message.topic != messages[start].topic
                || index - start == MAX_BATCH_ENTRIES
                || bytes + size > MAX_BATCH_BYTES);
        if full {
            chunks.push(start..index);
            start = index;
            bytes = 0;
        }
        bytes += size;
    }
    if start < messages.len() {
        chunks.push(start..messages.len());
    }
    chunks
}

fn classify<E, R>(err: SdkError<E, R>) -> PublishError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let Some(service) = err.as_service_error() {
        return PublishError::Rejected {
            code: service.code().unwrap_or("Unknown").to_string(),
            message: service.message().unwrap_or_default().to_string(),
        };
    }
    PublishError::Transport(DisplayErrorContext(&err).to_string())
}

/// Message attributes capped at [`MAX_ATTRIBUTES`]. Trace carrier entries come
/// last and are the ones dropped.
fn capped_attributes(message: &Message<'_>) -> Vec<(String, String)> {
    let mut attributes = message.attributes();
    if attributes.len() > MAX_ATTRIBUTES {
        warn!(
            event_id = %message.event_id,
            dropped = attributes.len() - MAX_ATTRIBUTES,
            "Message attributes over the broker limit were dropped."
        );
        attributes.truncate(MAX_ATTRIBUTES);
    }
    attributes
}

fn sqs_attributes(message: &Message<'_>) -> Result<Vec<(String, SqsAttribute)>, PublishError> {
    capped_attributes(message)
        .into_iter()
        .map(|(name, value)| {
            SqsAttribute::builder()
                .data_type(ATTRIBUTE_TYPE)
                .string_value(value)
                .build()
                .map(|attribute| (name, attribute))
                .map_err(|e| PublishError::InvalidRequest(e.to_string()))
        })
        .collect()
}

fn sns_attributes(message: &Message<'_>) -> Result<Vec<(String, SnsAttribute)>, PublishError> {
    capped_attributes(message)
        .into_iter()
        .map(|(name, value)| {
            SnsAttribute::builder()
                .data_type(ATTRIBUTE_TYPE)
                .string_value(value)
                .build()
                .map(|attribute| (name, attribute))
                .map_err(|e| PublishError::InvalidRequest(e.to_string()))
        })
        .collect()
}

/// Group and deduplication ids for FIFO channels, `None` otherwise.
fn fifo_ids<'a>(message: &Message<'a>, fifo: bool) -> (Option<&'a str>, Option<&'a str>) {
    if fifo {
        (Some(message.entity_id), Some(message.idempotency_key))
    } else {
        (None, None)
    }
}

fn sqs_entry(
    index: usize,
    message: &Message<'_>,
    fifo: bool,
) -> Result<SendMessageBatchRequestEntry, PublishError> {
    let body = std::str::from_utf8(message.payload)?;
    let (group_id, dedup_id) = fifo_ids(message, fifo);
    let mut entry = SendMessageBatchRequestEntry::builder()
        .id(index.to_string())
        .message_body(body)
        .set_message_group_id(group_id.map(str::to_string))
        .set_message_deduplication_id(dedup_id.map(str::to_string));
    for (name, attribute) in sqs_attributes(message)? {
        entry = entry.message_attributes(name, attribute);
    }
    entry
        .build()
        .map_err(|e| PublishError::InvalidRequest(e.to_string()))
}

fn sns_entry(
    index: usize,
    message: &Message<'_>,
    fifo: bool,
) -> Result<PublishBatchRequestEntry, PublishError> {
    let body = std::str::from_utf8(message.payload)?;
    let (group_id, dedup_id) = fifo_ids(message, fifo);
    let mut entry = PublishBatchRequestEntry::builder()
        .id(index.to_string())
        .message(body)
        .set_message_group_id(group_id.map(str::to_string))
        .set_message_deduplication_id(dedup_id.map(str::to_string));
    for (name, attribute) in sns_attributes(message)? {
        entry = entry.message_attributes(name, attribute);
    }
    entry
        .build()
        .map_err(|e| PublishError::InvalidRequest(e.to_string()))
}

/// Publishes to SQS queues and SNS topics depending on the event topic.
#[derive(Debug, Clone)]
pub struct AwsPublisher {
    sqs: SqsClient,
    sns: SnsClient,
}

impl AwsPublisher {
    pub fn new(sqs: SqsClient, sns: SnsClient) -> Self {
        Self { sqs, sns }
    }

    #[instrument(skip(self, chunk), fields(messages = chunk.len()))]
    async fn send_sqs_batch(
        &self,
        queue_url: &str,
        chunk: &[Message<'_>],
    ) -> Vec<Result<(), PublishError>> {
        let mut results = vec![Ok(()); chunk.len()];
        let mut entries = Vec::with_capacity(chunk.len());
        let fifo = queue_url.ends_with(FIFO_SUFFIX);
        for (index, message) in chunk.iter().enumerate() {
            match sqs_entry(index, message, fifo) {
                Ok(entry) => entries.push(entry),
                Err(err) => results[index] = Err(err),
            }
        }
        if entries.is_empty() {
            return results;
        }

        let sent = self
            .sqs
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await;

        match sent {
            Ok(output) => {
                for failed in output.failed() {
                    record_entry_failure(&mut results, failed.id(), failed.code(), failed.message());
                }
            }
            Err(err) => fail_remaining(&mut results, classify(err)),
        }
        results
    }

    #[instrument(skip(self, chunk), fields(messages = chunk.len()))]
    async fn send_sns_batch(
        &self,
        topic_arn: &str,
        chunk: &[Message<'_>],
    ) -> Vec<Result<(), PublishError>> {
        let mut results = vec![Ok(()); chunk.len()];
        let mut entries = Vec::with_capacity(chunk.len());
        let fifo = topic_arn.ends_with(FIFO_SUFFIX);
        for (index, message) in chunk.iter().enumerate() {
            match sns_entry(index, message, fifo) {
                Ok(entry) => entries.push(entry),
                Err(err) => results[index] = Err(err),
            }
        }
        if entries.is_empty() {
            return results;
        }

        let sent = self
            .sns
            .publish_batch()
            .topic_arn(topic_arn)
            .set_publish_batch_request_entries(Some(entries))
            .send()
            .await;

        match sent {
            Ok(output) => {
                for failed in output.failed() {
                    record_entry_failure(&mut results, failed.id(), failed.code(), failed.message());
                }
            }
            Err(err) => fail_remaining(&mut results, classify(err)),
        }
        results
    }
}

fn record_entry_failure(
    results: &mut [Result<(), PublishError>],
    id: &str,
    code: &str,
    message: Option<&str>,
) {
    match id.parse::<usize>().ok().and_then(|index| results.get_mut(index)) {
        Some(slot) => {
            *slot = Err(PublishError::Rejected {
                code: code.to_string(),
                message: message.unwrap_or_default().to_string(),
            });
        }
        None => warn!(entry_id = id, "Broker reported a failure for an unknown batch entry."),
    }
}

fn fail_remaining(results: &mut [Result<(), PublishError>], err: PublishError) {
    for slot in results.iter_mut().filter(|r| r.is_ok()) {
        *slot = Err(err.clone());
    }
}

#[async_trait]
impl Publisher for AwsPublisher {
    async fn publish(&self, message: &Message<'_>) -> Result<(), PublishError> {
        let body = std::str::from_utf8(message.payload)?;

        let channel = Channel::parse(message.topic);
        let (group_id, dedup_id) = fifo_ids(message, channel.is_fifo());
        match channel {
            Channel::Sqs { queue_url } => {
                let mut request = self
                    .sqs
                    .send_message()
                    .queue_url(queue_url)
                    .message_body(body)
                    .set_message_group_id(group_id.map(str::to_string))
                    .set_message_deduplication_id(dedup_id.map(str::to_string));
                for (name, attribute) in sqs_attributes(message)? {
                    request = request.message_attributes(name, attribute);
                }
                request.send().await.map_err(classify)?;
            }
            Channel::Sns { topic_arn } => {
                let mut request = self
                    .sns
                    .publish()
                    .topic_arn(topic_arn)
                    .message(body)
                    .set_message_group_id(group_id.map(str::to_string))
                    .set_message_deduplication_id(dedup_id.map(str::to_string));
                for (name, attribute) in sns_attributes(message)? {
                    request = request.message_attributes(name, attribute);
                }
                request.send().await.map_err(classify)?;
            }
        }
        Ok(())
    }

    async fn publish_batch(&self, messages: &[Message<'_>]) -> Vec<Result<(), PublishError>> {
        let mut results = Vec::with_capacity(messages.len());
        for range in plan_chunks(messages) {
            let chunk = &messages[range];
            let outcome = match Channel::parse(chunk[0].topic) {
                Channel::Sqs { queue_url } => self.send_sqs_batch(queue_url, chunk).await,
                Channel::Sns { topic_arn } => self.send_sns_batch(topic_arn, chunk).await,
            };
            debug!(
                topic = chunk[0].topic,
                sent = outcome.iter().filter(|r| r.is_ok()).count(),
                "Batch sent to broker."
            );
            results.extend(outcome);
        }
        results
    }
}
