//! Keep-alive sequence counters.
//!
//! Both directions count from 1. Outbound numbers are handed out once each;
//! inbound numbers must arrive exactly in order, and a gap means the peer's
//! view of the session can no longer be trusted.

use npac_protocol::Ack;

/// Outbound and expected inbound keep-alive sequence numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveCounters {
    next_outbound: u64,
    expected_inbound: u64,
}

impl KeepAliveCounters {
    /// Both counters at 1
    pub fn new() -> Self {
        Self {
            next_outbound: 1,
            expected_inbound: 1,
        }
    }

    /// Take the next outbound sequence number
    pub fn next_outbound(&mut self) -> u64 {
        let sequence = self.next_outbound;
        self.next_outbound += 1;
        sequence
    }

    /// Sequence number the peer must send next
    pub fn expected_inbound(&self) -> u64 {
        self.expected_inbound
    }

    /// Check an inbound sequence number; only a match advances the counter
    pub fn receive(&mut self, sequence: u64) -> Ack {
        if sequence == self.expected_inbound {
            self.expected_inbound += 1;
            Ack::Ack
        } else {
            Ack::Nack
        }
    }

    /// Back to 1 in both directions
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for KeepAliveCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_counts_from_one() {
        let mut counters = KeepAliveCounters::new();
        assert_eq!(counters.next_outbound(), 1);
        assert_eq!(counters.next_outbound(), 2);
        counters.reset();
        assert_eq!(counters.next_outbound(), 1);
    }

    #[test]
    fn test_inbound_gap_is_rejected_without_advancing() {
        let mut counters = KeepAliveCounters::new();
        assert_eq!(counters.receive(1), Ack::Ack);
        assert_eq!(counters.expected_inbound(), 2);

        assert_eq!(counters.receive(4), Ack::Nack);
        assert_eq!(counters.receive(4), Ack::Nack);
        assert_eq!(counters.expected_inbound(), 2);

        assert_eq!(counters.receive(2), Ack::Ack);
        assert_eq!(counters.expected_inbound(), 3);
    }
}
