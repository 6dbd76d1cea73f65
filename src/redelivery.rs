//! Redelivery decisions
//!
//! Maps a handler outcome and the broker's delivery count to the
//! settlement the consumer sends back. Pure and deterministic.

use crate::types::Outcome;
use std::time::Duration;

/// Why a message will not be delivered again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCause {
    /// The handler asked to terminate the message
    Rejected(String),
    /// The delivery cap was reached without a successful ack
    MaxDeliverExceeded,
}

/// Settlement for one delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Acknowledge
    Ack,
    /// Negative-acknowledge; `None` leaves the delay to the broker
    Redeliver(Option<Duration>),
    /// Terminate
    Terminal(TerminalCause),
}

/// Delivery cap plus an optional per-attempt delay schedule
#[derive(Debug, Clone, Default)]
pub struct RedeliveryPolicy {
    max_deliver: Option<u32>,
    backoff: Vec<Duration>,
}

impl RedeliveryPolicy {
    /// `max_deliver = None` means no cap
    pub fn new(max_deliver: Option<u32>) -> Self {
        Self {
            max_deliver,
            backoff: Vec::new(),
        }
    }

    /// Delay before redelivery `n` (1-indexed) is `backoff[n - 1]`; the
    /// last entry repeats
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_deliver(&self) -> Option<u32> {
        self.max_deliver
    }

    /// Whether this delivery is already past the cap
    ///
    /// Such a message is terminated without invoking the handler.
    pub fn exceeded(&self, delivery_count: u64) -> bool {
        matches!(self.max_deliver, Some(max) if delivery_count > u64::from(max))
    }

    pub fn decide(&self, delivery_count: u64, outcome: &Outcome) -> Decision {
        match outcome {
            Outcome::Ack => Decision::Ack,
            Outcome::Term(reason) => Decision::Terminal(TerminalCause::Rejected(reason.clone())),
            Outcome::Nak(delay) => {
                if self.is_last_delivery(delivery_count) {
                    Decision::Terminal(TerminalCause::MaxDeliverExceeded)
                } else {
                    Decision::Redeliver(delay.or_else(|| self.scheduled_delay(delivery_count)))
                }
            }
        }
    }

    fn is_last_delivery(&self, delivery_count: u64) -> bool {
        matches!(self.max_deliver, Some(max) if delivery_count >= u64::from(max))
    }

    fn scheduled_delay(&self, delivery_count: u64) -> Option<Duration> {
        if self.backoff.is_empty() {
            return None;
        }
        let index = (delivery_count.max(1) - 1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_is_always_ack() {
        let policy = RedeliveryPolicy::new(Some(3));
        for count in 1..=5 {
            assert_eq!(policy.decide(count, &Outcome::Ack), Decision::Ack);
        }
    }

    #[test]
    fn test_nak_below_cap_redelivers() {
        let policy = RedeliveryPolicy::new(Some(3));
        assert_eq!(policy.decide(1, &Outcome::nak()), Decision::Redeliver(None));
        assert_eq!(
            policy.decide(2, &Outcome::nak_after(Duration::from_secs(4))),
            Decision::Redeliver(Some(Duration::from_secs(4)))
        );
    }

    #[test]
    fn test_nak_at_cap_is_terminal() {
        let policy = RedeliveryPolicy::new(Some(3));
        assert_eq!(
            policy.decide(3, &Outcome::nak()),
            Decision::Terminal(TerminalCause::MaxDeliverExceeded)
        );
        assert_eq!(
            policy.decide(9, &Outcome::nak()),
            Decision::Terminal(TerminalCause::MaxDeliverExceeded)
        );
    }

    #[test]
    fn test_single_delivery_cap() {
        let policy = RedeliveryPolicy::new(Some(1));
        assert_eq!(
            policy.decide(1, &Outcome::nak()),
            Decision::Terminal(TerminalCause::MaxDeliverExceeded)
        );
        assert!(!policy.exceeded(1));
        assert!(policy.exceeded(2));
    }

    #[test]
    fn test_unlimited_never_terminal() {
        let policy = RedeliveryPolicy::new(None);
        assert_eq!(policy.decide(10_000, &Outcome::nak()), Decision::Redeliver(None));
        assert!(!policy.exceeded(u64::MAX));
    }

    #[test]
    fn test_term_carries_reason() {
        let policy = RedeliveryPolicy::new(Some(5));
        assert_eq!(
            policy.decide(1, &Outcome::term("invalid course code")),
            Decision::Terminal(TerminalCause::Rejected("invalid course code".into()))
        );
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RedeliveryPolicy::new(Some(10)).with_backoff(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ]);
        assert_eq!(policy.decide(1, &Outcome::nak()), Decision::Redeliver(Some(Duration::from_secs(1))));
        assert_eq!(policy.decide(2, &Outcome::nak()), Decision::Redeliver(Some(Duration::from_secs(5))));
        assert_eq!(policy.decide(7, &Outcome::nak()), Decision::Redeliver(Some(Duration::from_secs(30))));
        // Handler delay wins over the schedule
        assert_eq!(
            policy.decide(1, &Outcome::nak_after(Duration::from_millis(10))),
            Decision::Redeliver(Some(Duration::from_millis(10)))
        );
    }

    #[test]
    fn test_deterministic() {
        let policy = RedeliveryPolicy::new(Some(4));
        for count in 0..8 {
            for outcome in [Outcome::Ack, Outcome::nak(), Outcome::term("x")] {
                assert_eq!(policy.decide(count, &outcome), policy.decide(count, &outcome));
            }
        }
    }
}
