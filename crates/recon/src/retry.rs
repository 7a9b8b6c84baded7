use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::feeds::{FeedError, RawEvent};

/// Cooperative cancellation for batch loops: the loop checks the flag
/// between records, so a stop request never leaves a record half-done.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One page of raw events. The cursor is the last-seen record key, not
/// an offset, so a resumed run is unaffected by concurrent inserts.
#[derive(Debug, Default)]
pub struct FeedChunk {
    pub events: Vec<RawEvent>,
    pub next_cursor: Option<String>,
}

/// An external payment/settlement feed, fetched in bounded chunks.
pub trait Feed {
    fn fetch_chunk(
        &mut self,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<FeedChunk, FeedError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            call_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        // 1x, 2x, 4x, ...
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

/// Drains a feed chunk by chunk with per-call timeout and bounded
/// retry. A chunk that keeps failing aborts the whole batch: partial
/// progress is reported through the error, never silently committed.
pub async fn drain_feed<F: Feed>(
    feed: &mut F,
    policy: RetryPolicy,
    cancel: &CancelFlag,
) -> Result<Vec<RawEvent>, FeedError> {
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }

        let chunk = fetch_with_retry(feed, cursor.as_deref(), policy, cancel).await?;
        events.extend(chunk.events);

        match chunk.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(events),
        }
    }
}

async fn fetch_with_retry<F: Feed>(
    feed: &mut F,
    cursor: Option<&str>,
    policy: RetryPolicy,
    cancel: &CancelFlag,
) -> Result<FeedChunk, FeedError> {
    let mut last_error = String::new();

    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }
        if attempt > 0 {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }

        match tokio::time::timeout(policy.call_timeout, feed.fetch_chunk(cursor)).await {
            Ok(Ok(chunk)) => return Ok(chunk),
            Ok(Err(e)) => {
                tracing::warn!("Feed chunk failed (attempt {}): {e}", attempt + 1);
                last_error = e.to_string();
            }
            Err(_) => {
                tracing::warn!("Feed chunk timed out (attempt {})", attempt + 1);
                last_error = FeedError::Timeout.to_string();
            }
        }
    }

    Err(FeedError::Aborted {
        attempts: policy.max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Scripted feed: pages of events, optionally failing the first N
    /// calls.
    struct ScriptedFeed {
        pages: Vec<Vec<RawEvent>>,
        served: usize,
        failures_left: u32,
    }

    impl Feed for ScriptedFeed {
        async fn fetch_chunk(&mut self, cursor: Option<&str>) -> Result<FeedChunk, FeedError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(FeedError::Timeout);
            }
            let page = cursor.map(|c| c.parse::<usize>().unwrap() + 1).unwrap_or(0);
            self.served += 1;
            let events = self.pages.get(page).cloned().unwrap_or_default();
            let next_cursor = (page + 1 < self.pages.len()).then(|| page.to_string());
            Ok(FeedChunk { events, next_cursor })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            call_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn drains_all_pages_by_cursor() {
        let mut feed = ScriptedFeed {
            pages: vec![vec![json!({"n": 1}), json!({"n": 2})], vec![json!({"n": 3})]],
            served: 0,
            failures_left: 0,
        };
        let events = drain_feed(&mut feed, fast_policy(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(feed.served, 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let mut feed = ScriptedFeed {
            pages: vec![vec![json!({"n": 1})]],
            served: 0,
            failures_left: 2,
        };
        let events = drain_feed(&mut feed, fast_policy(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_aborts_batch() {
        let mut feed = ScriptedFeed {
            pages: vec![vec![json!({"n": 1})]],
            served: 0,
            failures_left: 10,
        };
        let err = drain_feed(&mut feed, fast_policy(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Aborted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn cancel_stops_before_next_chunk() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut feed = ScriptedFeed {
            pages: vec![vec![json!({"n": 1})]],
            served: 0,
            failures_left: 0,
        };
        let err = drain_feed(&mut feed, fast_policy(), &cancel).await.unwrap_err();
        assert!(matches!(err, FeedError::Cancelled));
        assert_eq!(feed.served, 0);
    }
}
