// ABOUTME: Interval-based coalescing of outbound event delivery
// ABOUTME: Merges text bursts with a guaranteed flush before structure and terminals

use crate::channel::Subscription;
use corral_stream::{EventPayload, StreamEvent};
use futures::Stream;
use std::time::Duration;
use tracing::debug;

/// Default coalescing window in milliseconds.
/// Can be overridden via CORRAL_COALESCE_INTERVAL_MS environment variable.
const DEFAULT_COALESCE_INTERVAL_MS: u64 = 250;

/// Bounds outbound update frequency for fast producers.
///
/// Consecutive text events are merged and released on a fixed interval.
/// Pending text is always force-flushed before a `tool_use`/`tool_result`
/// boundary and before any terminal event, so a consumer never sees a
/// stall followed by a jump at the end of a stream.
#[derive(Debug, Clone, Copy)]
pub struct Coalescer {
    interval: Duration,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_env() -> Self {
        let millis = std::env::var("CORRAL_COALESCE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| (10..=5000).contains(&v))
            .unwrap_or(DEFAULT_COALESCE_INTERVAL_MS);
        Self::new(Duration::from_millis(millis))
    }

    /// Wrap a subscription in a coalesced delivery stream.
    ///
    /// The returned stream preserves event order and sequence numbers;
    /// merged text carries the sequence number of its last constituent.
    pub fn apply(self, mut sub: Subscription) -> impl Stream<Item = StreamEvent> {
        async_stream::stream! {
            let mut pending: Option<StreamEvent> = None;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    event = sub.next_event() => {
                        match event {
                            Some(event) => {
                                if let EventPayload::Text { text } = &event.payload {
                                    match pending.as_mut() {
                                        Some(held) => {
                                            if let EventPayload::Text { text: merged } =
                                                &mut held.payload
                                            {
                                                merged.push_str(text);
                                            }
                                            held.seq = event.seq;
                                        }
                                        None => pending = Some(event),
                                    }
                                } else {
                                    // Structural or terminal boundary: release
                                    // anything held back before it.
                                    if let Some(held) = pending.take() {
                                        yield held;
                                    }
                                    let terminal = event.payload.is_terminal();
                                    yield event;
                                    if terminal {
                                        break;
                                    }
                                }
                            }
                            None => {
                                if let Some(held) = pending.take() {
                                    yield held;
                                }
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if let Some(held) = pending.take() {
                            debug!(seq = held.seq, "Flushing coalesced text");
                            yield held;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SessionChannel;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn text(s: &str) -> EventPayload {
        EventPayload::Text { text: s.into() }
    }

    #[tokio::test]
    async fn test_text_burst_merges_and_flushes_before_structure() {
        let channel = Arc::new(SessionChannel::new("s1"));
        channel.begin_stream().unwrap();
        let sub = channel.subscribe();

        channel.publish(text("a")).unwrap();
        channel.publish(text("b")).unwrap();
        channel.publish(text("c")).unwrap();
        channel
            .publish(EventPayload::ToolUse {
                id: "t1".into(),
                name: "bash".into(),
                input: serde_json::json!({}),
            })
            .unwrap();
        channel.publish(EventPayload::Done { summary: None }).unwrap();

        // Interval far longer than the test: any flush observed is a
        // boundary flush, not a timer firing.
        let coalesced = Coalescer::new(Duration::from_secs(60)).apply(sub);
        let events: Vec<StreamEvent> = coalesced.collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload, text("abc"));
        assert_eq!(events[0].seq, 3);
        assert_eq!(events[1].payload.kind(), "tool_use");
        assert_eq!(events[2].payload.kind(), "done");
    }

    #[tokio::test]
    async fn test_pending_text_flushes_before_terminal() {
        let channel = Arc::new(SessionChannel::new("s1"));
        channel.begin_stream().unwrap();
        let sub = channel.subscribe();

        channel.publish(text("almost")).unwrap();
        channel.publish(EventPayload::Aborted).unwrap();

        let coalesced = Coalescer::new(Duration::from_secs(60)).apply(sub);
        let events: Vec<StreamEvent> = coalesced.collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload, text("almost"));
        assert_eq!(events[1].payload, EventPayload::Aborted);
    }

    #[tokio::test]
    async fn test_interval_releases_text_while_stream_is_quiet() {
        let channel = Arc::new(SessionChannel::new("s1"));
        channel.begin_stream().unwrap();
        let sub = channel.subscribe();

        channel.publish(text("early")).unwrap();

        let mut coalesced = Box::pin(Coalescer::new(Duration::from_millis(20)).apply(sub));

        // No boundary has been published; only the ticker can release this.
        let first = tokio::time::timeout(Duration::from_secs(5), coalesced.next())
            .await
            .expect("coalesced text should be released by the interval")
            .unwrap();
        assert_eq!(first.payload, text("early"));

        channel.publish(EventPayload::Done { summary: None }).unwrap();
        let last = coalesced.next().await.unwrap();
        assert_eq!(last.payload.kind(), "done");
        assert_eq!(coalesced.next().await, None);
    }
}
