//! Bucketed sliding window of request and token consumption.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    requests: u64,
    tokens: u64,
}

/// Consumption over the trailing `span`, kept in buckets of `span / buckets`.
///
/// A bucket leaves the window once `start + span <= now`, so usage is
/// released bucket by bucket rather than all at once.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    span: Duration,
    bucket_width: Duration,
    buckets: VecDeque<Bucket>,
}

impl SlidingWindow {
    pub fn new(span: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        Self {
            span,
            bucket_width: span / buckets,
            buckets: VecDeque::with_capacity(buckets as usize + 1),
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if front.start + self.span <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(requests, tokens)` consumed inside the window.
    pub fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(r, t), b| {
            (r + b.requests, t.saturating_add(b.tokens))
        })
    }

    /// Record one request of `tokens`; returns the start of the bucket it landed in.
    pub fn record(&mut self, now: Instant, tokens: u64) -> Instant {
        self.prune(now);
        match self.buckets.back_mut() {
            Some(back) if now < back.start + self.bucket_width => {
                back.requests += 1;
                back.tokens = back.tokens.saturating_add(tokens);
                back.start
            }
            _ => {
                self.buckets.push_back(Bucket {
                    start: now,
                    requests: 1,
                    tokens,
                });
                now
            }
        }
    }

    /// Replace `estimated` with `actual` tokens in the bucket starting at `bucket_start`.
    ///
    /// No-op once that bucket has left the window.
    pub fn adjust_tokens(&mut self, bucket_start: Instant, estimated: u64, actual: u64) {
        if let Some(bucket) = self.buckets.iter_mut().find(|b| b.start == bucket_start) {
            bucket.tokens = bucket.tokens.saturating_sub(estimated).saturating_add(actual);
        }
    }

    /// Time until the oldest bucket expires (zero when empty).
    pub fn retry_after(&mut self, now: Instant) -> Duration {
        self.prune(now);
        self.buckets
            .front()
            .map(|b| (b.start + self.span).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_buckets_expire_individually() {
        let mut window = SlidingWindow::new(Duration::from_secs(60), 60);
        let start = Instant::now();

        window.record(start, 100);
        tokio::time::advance(Duration::from_secs(30)).await;
        window.record(Instant::now(), 50);
        assert_eq!(window.totals(Instant::now()), (2, 150));

        // First bucket expires at t=60, the second at t=90.
        assert_eq!(window.retry_after(Instant::now()), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(window.totals(Instant::now()), (1, 50));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(window.totals(Instant::now()), (0, 0));
        assert_eq!(window.retry_after(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_accumulates() {
        let mut window = SlidingWindow::new(Duration::from_secs(60), 60);
        let a = window.record(Instant::now(), 10);
        tokio::time::advance(Duration::from_millis(500)).await;
        let b = window.record(Instant::now(), 10);
        assert_eq!(a, b);
        assert_eq!(window.totals(Instant::now()), (2, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_tokens() {
        let mut window = SlidingWindow::new(Duration::from_secs(60), 60);
        let bucket = window.record(Instant::now(), 500);
        window.adjust_tokens(bucket, 500, 120);
        assert_eq!(window.totals(Instant::now()), (1, 120));
    }
}
