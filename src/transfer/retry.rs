//! Retry policy for failed transfers

use crate::transfer::types::QueuedTransfer;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do with a transfer whose batch failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put this record back at the tail of the queue
    Requeue(QueuedTransfer),
    /// Retry budget spent; the transfer stays Failed
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide on a failed transfer. A retry keeps the identifier, bumps the
    /// counter and refreshes the timestamp.
    pub fn evaluate(&self, transfer: &QueuedTransfer, now_ms: i64) -> RetryDecision {
        if transfer.retries < self.max_retries {
            RetryDecision::Requeue(transfer.next_attempt(now_ms))
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::TransferRequest;

    #[test]
    fn test_requeue_until_exhausted() {
        let policy = RetryPolicy::default();
        let mut transfer = QueuedTransfer::new(TransferRequest::new("a.testnet", "1"), 0);
        let id = transfer.id.clone();

        for attempt in 1..=3 {
            match policy.evaluate(&transfer, attempt * 100) {
                RetryDecision::Requeue(next) => {
                    assert_eq!(next.id, id);
                    assert_eq!(next.retries, attempt as u32);
                    assert_eq!(next.timestamp, attempt * 100);
                    transfer = next;
                }
                RetryDecision::Exhausted => panic!("exhausted at attempt {}", attempt),
            }
        }
        assert_eq!(policy.evaluate(&transfer, 1_000), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(0);
        let transfer = QueuedTransfer::new(TransferRequest::new("a.testnet", "1"), 0);
        assert_eq!(policy.evaluate(&transfer, 10), RetryDecision::Exhausted);
    }
}
