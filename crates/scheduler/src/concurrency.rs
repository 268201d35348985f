//! Concurrency limit for admitted fetches
//!
//! At most `max` fetches run at once. While urgent keys are waiting the cap is
//! raised by `urgent_boost`, and only urgent keys may use the extra slots.

use crate::priority::{AdmissionQueue, Tier};
use std::hash::Hash;

/// Which queued keys a free slot may be given to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGrant {
    /// Below the base cap: any tier, highest first
    AnyTier,

    /// Inside the urgent boost: urgent keys only
    UrgentOnly,
}

/// In-flight counter with a base cap and an urgent boost
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    max: usize,
    urgent_boost: usize,
    in_flight: usize,
    peak: usize,
}

impl ConcurrencyLimit {
    pub fn new(max: usize, urgent_boost: usize) -> Self {
        Self {
            max,
            urgent_boost,
            in_flight: 0,
            peak: 0,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn urgent_boost(&self) -> usize {
        self.urgent_boost
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Highest in-flight count observed so far
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Cap in effect given whether urgent keys are waiting
    pub fn effective_cap(&self, urgent_waiting: bool) -> usize {
        if urgent_waiting {
            self.max + self.urgent_boost
        } else {
            self.max
        }
    }

    /// Whether a slot is free, and for which tiers
    pub fn grant(&self, urgent_waiting: bool) -> Option<SlotGrant> {
        if self.in_flight < self.max {
            Some(SlotGrant::AnyTier)
        } else if urgent_waiting && self.in_flight < self.max + self.urgent_boost {
            Some(SlotGrant::UrgentOnly)
        } else {
            None
        }
    }

    /// Pop the next admissible key and take a slot for it.
    ///
    /// Returns `None` without touching the queue when no slot is available
    /// for any waiting key.
    pub fn admit_next<K>(&mut self, queue: &mut AdmissionQueue<K>) -> Option<(K, Tier)>
    where
        K: Clone + Eq + Hash,
    {
        let urgent_waiting = queue.len_tier(Tier::Urgent) > 0;
        let admitted = match self.grant(urgent_waiting)? {
            SlotGrant::AnyTier => queue.pop()?,
            SlotGrant::UrgentOnly => (queue.pop_tier(Tier::Urgent)?, Tier::Urgent),
        };
        self.acquire();
        Some(admitted)
    }

    /// Take a slot unconditionally
    pub fn acquire(&mut self) {
        self.in_flight += 1;
        self.peak = self.peak.max(self.in_flight);
    }

    /// Return a slot
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Change the base cap; running fetches are unaffected.
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant() {
        let mut limit = ConcurrencyLimit::new(2, 1);
        assert_eq!(limit.grant(false), Some(SlotGrant::AnyTier));

        limit.acquire();
        limit.acquire();
        assert_eq!(limit.grant(false), None);
        assert_eq!(limit.grant(true), Some(SlotGrant::UrgentOnly));

        limit.acquire();
        assert_eq!(limit.grant(true), None);
        assert_eq!(limit.peak(), 3);
    }

    #[test]
    fn test_effective_cap() {
        let limit = ConcurrencyLimit::new(24, 4);
        assert_eq!(limit.effective_cap(false), 24);
        assert_eq!(limit.effective_cap(true), 28);
    }

    #[test]
    fn test_admit_next_respects_tiers() {
        let mut limit = ConcurrencyLimit::new(1, 0);
        let mut queue = AdmissionQueue::new();
        queue.push("low", Tier::Low);
        queue.push("urgent", Tier::Urgent);

        assert_eq!(limit.admit_next(&mut queue), Some(("urgent", Tier::Urgent)));
        assert_eq!(limit.admit_next(&mut queue), None);
        assert_eq!(queue.len(), 1);

        limit.release();
        assert_eq!(limit.admit_next(&mut queue), Some(("low", Tier::Low)));
    }

    #[test]
    fn test_boost_only_serves_urgent() {
        let mut limit = ConcurrencyLimit::new(1, 1);
        let mut queue = AdmissionQueue::new();
        queue.push("high", Tier::High);
        assert!(limit.admit_next(&mut queue).is_some());

        // Base cap reached: a high key must wait
        queue.push("high2", Tier::High);
        assert_eq!(limit.admit_next(&mut queue), None);

        // An urgent key may use the boost slot, skipping the high key
        queue.push("urgent", Tier::Urgent);
        assert_eq!(limit.admit_next(&mut queue), Some(("urgent", Tier::Urgent)));
        assert_eq!(limit.in_flight(), 2);
        assert_eq!(limit.admit_next(&mut queue), None);
    }

    #[test]
    fn test_in_flight_never_exceeds_cap() {
        let mut limit = ConcurrencyLimit::new(3, 2);
        let mut queue = AdmissionQueue::new();
        for i in 0..20 {
            let tier = Tier::DESCENDING[i % 3];
            queue.push(i, tier);
        }

        for round in 0..40 {
            while let Some((_, tier)) = limit.admit_next(&mut queue) {
                if limit.in_flight() > limit.max() {
                    assert_eq!(tier, Tier::Urgent);
                }
            }
            assert!(limit.in_flight() <= limit.max() + limit.urgent_boost());
            if round % 2 == 0 {
                limit.release();
            }
        }
        assert!(limit.peak() <= 5);
    }

    #[test]
    fn test_release_saturates() {
        let mut limit = ConcurrencyLimit::new(1, 0);
        limit.release();
        assert_eq!(limit.in_flight(), 0);
    }
}
