use serde::Serialize;
use tracing::{debug, warn};

use crate::runtime::model::{RfqEvent, RfqMeta};

/// Hands a serialized notification to whatever delivers it. Called only after
/// the described event is durably committed.
pub trait EventNotifier {
    fn notify(&self, payload: &[u8]) -> Result<(), String>;
}

impl<F> EventNotifier for F
where
    F: Fn(&[u8]) -> Result<(), String>,
{
    fn notify(&self, payload: &[u8]) -> Result<(), String> {
        self(payload)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl EventNotifier for NoopNotifier {
    fn notify(&self, _payload: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

pub struct SqsNotifier {
    queue_url: String,
    sqs_client: aws_sdk_sqs::Client,
}

impl SqsNotifier {
    pub fn new(queue_url: impl Into<String>, sqs_client: aws_sdk_sqs::Client) -> Self {
        Self {
            queue_url: queue_url.into(),
            sqs_client,
        }
    }
}

impl EventNotifier for SqsNotifier {
    fn notify(&self, payload: &[u8]) -> Result<(), String> {
        let body = String::from_utf8(payload.to_vec())
            .map_err(|error| format!("invalid UTF-8 notification payload: {error}"))?;
        let client = self.sqs_client.clone();
        let queue_url = self.queue_url.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .send_message()
                    .queue_url(queue_url)
                    .message_body(body)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("failed to enqueue notification: {error}"))
            })
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RfqCreated,
    MessagePosted,
    StatusChanged,
}

#[derive(Debug, Serialize)]
pub struct NotificationMessage<'a> {
    pub kind: NotificationKind,
    pub rfq: &'a RfqMeta,
    pub event: &'a RfqEvent,
}

/// Best effort: failures are logged and swallowed so they can never turn a
/// committed write into a failed request.
pub fn dispatch_notification(
    notifier: &dyn EventNotifier,
    kind: NotificationKind,
    rfq: &RfqMeta,
    event: &RfqEvent,
) {
    let message = NotificationMessage { kind, rfq, event };
    let payload = match serde_json::to_vec(&message) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(
                rfq_id = %rfq.id,
                event_id = %event.id,
                error = %error,
                "failed to encode notification"
            );
            return;
        }
    };

    match notifier.notify(&payload) {
        Ok(()) => debug!(rfq_id = %rfq.id, event_id = %event.id, ?kind, "notification dispatched"),
        Err(error) => warn!(
            rfq_id = %rfq.id,
            event_id = %event.id,
            ?kind,
            error = %error,
            "notification dispatch failed"
        ),
    }
}
