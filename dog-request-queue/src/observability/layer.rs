use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use super::LiveMetrics;
use crate::{backend::BoxStream, QueueEvent};

const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Fans queue events out to subscribers and keeps live counters.
///
/// Publishing never fails: with no subscriber the event is dropped.
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<QueueEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Update counters for `event` and broadcast it
    pub fn record(&self, event: QueueEvent) {
        match &event {
            QueueEvent::RequestAdded { .. } => self.metrics.increment_added(),
            QueueEvent::RequestLeased { .. } => self.metrics.add_leased(1),
            QueueEvent::RequestHandled { .. } => self.metrics.increment_handled(),
            QueueEvent::RequestReclaimed { .. } => self.metrics.increment_reclaimed(),
            _ => {}
        }

        debug!("Recorded {} on {}", event.event_name(), event.queue());
        let _ = self.event_broadcaster.send(event);
    }

    /// Raw receiver for subscribers that want to handle lag themselves
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Stream of events; events missed by a lagging subscriber are skipped
    pub fn event_stream(&self) -> BoxStream<QueueEvent> {
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe())
            .filter_map(|event| event.ok());
        Box::pin(stream)
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_events_reach_stream_and_counters() {
        let layer = ObservabilityLayer::new();
        let mut events = layer.event_stream();

        layer.record(QueueEvent::RequestHandled {
            queue: "books".to_string(),
            request_id: RequestId::from("r1"),
            at: Utc::now(),
        });

        let event = events.next().await.unwrap();
        assert_eq!(event.event_name(), "request_handled");
        assert_eq!(layer.metrics().requests_handled(), 1);
    }

    #[test]
    fn test_record_without_subscribers_is_fine() {
        let layer = ObservabilityLayer::new();
        layer.record(QueueEvent::QueueDropped {
            queue: "books".to_string(),
            at: Utc::now(),
        });
        assert_eq!(layer.metrics().requests_added(), 0);
    }
}
