//! Per-switch byte budget

use std::time::Duration;

use tokio::time::Instant;

/// Token bucket measured in bytes
///
/// Holds at most one second of traffic. A message larger than the burst is
/// let through once the bucket is full so that it can never stall a queue.
#[derive(Debug)]
pub struct ByteBucket {
    bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl ByteBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            tokens: bytes_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    fn burst(&self) -> f64 {
        self.bytes_per_sec as f64
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.burst());
        self.last_refill = now;
    }

    fn cost(&self, bytes: usize) -> f64 {
        (bytes as f64).min(self.burst())
    }

    /// Take `bytes` if the budget allows it
    pub fn try_take(&mut self, bytes: usize) -> bool {
        self.refill();
        let cost = self.cost(bytes);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Time until `bytes` can be taken
    pub fn wait_time(&mut self, bytes: usize) -> Duration {
        self.refill();
        let missing = self.cost(bytes) - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.bytes_per_sec as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_refills_over_time() {
        let mut bucket = ByteBucket::new(100);
        assert!(bucket.try_take(80));
        assert!(!bucket.try_take(80));
        let wait = bucket.wait_time(80);
        assert!(wait > Duration::from_millis(590) && wait <= Duration::from_millis(601));

        tokio::time::advance(Duration::from_millis(610)).await;
        assert!(bucket.try_take(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_waits_for_full_bucket() {
        let mut bucket = ByteBucket::new(10);
        assert!(bucket.try_take(500));
        assert!(!bucket.try_take(500));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_take(500));
    }
}
