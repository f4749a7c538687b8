use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::kv::Kv;

const CHANNEL_CAPACITY: usize = 1024;

/// Telemetry events off the hot path. Recording never blocks and never
/// fails the caller; when the channel is full the event is dropped.
#[derive(Debug, Clone)]
pub enum Event {
    SearchCacheHit,
    SearchCoalesced,
    SearchLocalOnly,
    SearchEnqueued,
    SearchDeferred { reason: &'static str },
    SyncCompleted { source: &'static str, chapters: usize },
    NotificationsInserted { count: usize },
}

impl Event {
    fn counter_field(&self) -> String {
        match self {
            Event::SearchCacheHit => "search_cache_hit".into(),
            Event::SearchCoalesced => "search_coalesced".into(),
            Event::SearchLocalOnly => "search_local_only".into(),
            Event::SearchEnqueued => "search_enqueued".into(),
            Event::SearchDeferred { reason } => format!("search_deferred:{}", reason),
            Event::SyncCompleted { source, .. } => format!("sync_completed:{}", source),
            Event::NotificationsInserted { .. } => "notifications_inserted".into(),
        }
    }

    fn increment(&self) -> u64 {
        match self {
            Event::NotificationsInserted { count } => *count as u64,
            Event::SyncCompleted { chapters, .. } => (*chapters).max(1) as u64,
            _ => 1,
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsHandle {
    tx: mpsc::Sender<Event>,
}

impl AnalyticsHandle {
    pub fn record(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            debug!("Analytics channel full; dropping event.");
        }
    }
}

/// Start the background consumer. Counters land in a KV hash so the whole
/// fleet shares one view.
pub fn start(kv: Kv) -> AnalyticsHandle {
    let (tx, mut rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let counters_key = kv.key("analytics:counters");
        while let Some(event) = rx.recv().await {
            let mut conn = kv.conn();
            let written: Result<(), redis::RedisError> = conn
                .hincr(&counters_key, event.counter_field(), event.increment())
                .await;
            if let Err(err) = written {
                warn!(?err, "Failed to flush analytics counter.");
            }
        }
    });
    AnalyticsHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_fields_are_stable() {
        assert_eq!(Event::SearchCacheHit.counter_field(), "search_cache_hit");
        assert_eq!(
            Event::SearchDeferred { reason: "low_heat" }.counter_field(),
            "search_deferred:low_heat"
        );
        assert_eq!(
            Event::NotificationsInserted { count: 7 }.increment(),
            7
        );
    }
}
