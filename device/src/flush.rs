use chrono::Utc;
use tracing::{info, warn};

use crate::broker::BrokerSession;
use crate::config::TrackerConfig;
use crate::error::StoreError;
use crate::storage::QueueStore;
use crate::types::{EventSink, StatusEvent, StatusKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub published: usize,
    pub pending: usize,
    /// The publish error that stopped the flush, if any.
    pub error: Option<String>,
}

impl FlushReport {
    pub fn drained(&self) -> bool {
        self.pending == 0
    }
}

/// Publishes the queue in order and stops at the first failure.
///
/// The failed entry and everything after it are written back unchanged
/// (no skipping, no reordering); published entries are emitted as
/// `last_payload` events with their `sent_at` stamp. Ends with a `drained`
/// or `pending` status.
pub async fn flush(
    queue: &mut QueueStore,
    session: &dyn BrokerSession,
    config: &TrackerConfig,
    events: &EventSink,
) -> Result<FlushReport, StoreError> {
    let entries = queue.load();
    let total = entries.len();
    let mut published = 0;
    let mut failure = None;

    for entry in &entries {
        let mut outgoing = entry.clone();
        outgoing.stamp_sent(Utc::now());
        let body = serde_json::to_vec(&outgoing)?;

        match session.publish(&config.topic, config.qos, body).await {
            Ok(()) => {
                published += 1;
                events.last_payload(outgoing);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    published,
                    remaining = total - published,
                    "Publish failed, keeping remainder queued"
                );
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let remainder = &entries[published..];
    queue.save(remainder)?;

    let report = FlushReport {
        published,
        pending: remainder.len(),
        error: failure,
    };

    let mut status = if report.drained() {
        StatusEvent::new(StatusKind::Drained)
    } else {
        StatusEvent::new(StatusKind::Pending)
    }
    .with_topic(config.topic.clone())
    .with_pending(report.pending);
    if let Some(error) = &report.error {
        status = status.with_error(error);
    }
    events.status(status);

    info!(
        published = report.published,
        pending = report.pending,
        topic = %config.topic,
        "Flush finished"
    );
    Ok(report)
}
