//! Priority tiers and the deduplicating admission queue
//!
//! Keys wait in one of three FIFO lanes (urgent, high, low) until a
//! concurrency slot frees. A key occupies at most one position across all
//! lanes; enqueueing it again can only promote it, while an explicit
//! reprioritization may also demote it.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Priority tier assigned by visibility
///
/// Higher variants are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Tier {
    /// Off-screen; loaded by the background filler
    #[default]
    Low = 0,

    /// Partially visible or inside the lookahead margin
    High = 1,

    /// Substantially visible
    Urgent = 2,
}

impl Tier {
    /// All tiers in admission order
    pub const DESCENDING: [Tier; 3] = [Tier::Urgent, Tier::High, Tier::Low];

    fn lane(self) -> usize {
        self as usize
    }
}

/// Outcome of [`AdmissionQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The key was not queued before
    Inserted,

    /// The key moved up from the given tier
    Promoted(Tier),

    /// The key was already queued at this tier or a higher one
    AlreadyQueued(Tier),
}

/// Three FIFO lanes with a key index
///
/// # Example
///
/// ```
/// use thumbgrid_scheduler::{AdmissionQueue, Tier};
///
/// let mut queue = AdmissionQueue::new();
/// queue.push("background.png", Tier::Low);
/// queue.push("visible.png", Tier::Urgent);
///
/// assert_eq!(queue.pop(), Some(("visible.png", Tier::Urgent)));
/// assert_eq!(queue.pop(), Some(("background.png", Tier::Low)));
/// ```
#[derive(Debug)]
pub struct AdmissionQueue<K> {
    lanes: [VecDeque<K>; 3],
    index: HashMap<K, Tier>,
}

impl<K: Clone + Eq + Hash> AdmissionQueue<K> {
    pub fn new() -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            index: HashMap::new(),
        }
    }

    /// Queue `key` at `tier`, or promote it if it waits at a lower tier.
    ///
    /// Never demotes and never creates a second position for the key.
    pub fn push(&mut self, key: K, tier: Tier) -> Enqueued {
        match self.index.get(&key).copied() {
            None => {
                self.lanes[tier.lane()].push_back(key.clone());
                self.index.insert(key, tier);
                Enqueued::Inserted
            }
            Some(current) if current < tier => {
                self.move_key(&key, current, tier);
                Enqueued::Promoted(current)
            }
            Some(current) => Enqueued::AlreadyQueued(current),
        }
    }

    /// Move a still-queued key to exactly `tier`.
    ///
    /// Returns `false` when the key is not queued (for example because it was
    /// already admitted); nothing is enqueued in that case.
    pub fn reprioritize(&mut self, key: &K, tier: Tier) -> bool {
        match self.index.get(key).copied() {
            Some(current) => {
                if current != tier {
                    self.move_key(key, current, tier);
                }
                true
            }
            None => false,
        }
    }

    /// Pop the oldest key of the highest non-empty tier
    pub fn pop(&mut self) -> Option<(K, Tier)> {
        Tier::DESCENDING
            .into_iter()
            .find_map(|tier| self.pop_tier(tier).map(|key| (key, tier)))
    }

    /// Pop the oldest key of one tier
    pub fn pop_tier(&mut self, tier: Tier) -> Option<K> {
        let key = self.lanes[tier.lane()].pop_front()?;
        self.index.remove(&key);
        Some(key)
    }

    /// Remove a key wherever it is queued
    pub fn remove(&mut self, key: &K) -> Option<Tier> {
        let tier = self.index.remove(key)?;
        self.lanes[tier.lane()].retain(|k| k != key);
        Some(tier)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn tier_of(&self, key: &K) -> Option<Tier> {
        self.index.get(key).copied()
    }

    /// Total number of queued keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn len_tier(&self, tier: Tier) -> usize {
        self.lanes[tier.lane()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Queued keys of one tier in admission order
    pub fn keys(&self, tier: Tier) -> impl Iterator<Item = &K> {
        self.lanes[tier.lane()].iter()
    }

    /// Empty every lane, returning the dropped keys in admission order
    pub fn clear(&mut self) -> Vec<K> {
        let mut dropped = Vec::with_capacity(self.len());
        for tier in Tier::DESCENDING {
            dropped.extend(self.lanes[tier.lane()].drain(..));
        }
        self.index.clear();
        dropped
    }

    fn move_key(&mut self, key: &K, from: Tier, to: Tier) {
        self.lanes[from.lane()].retain(|k| k != key);
        self.lanes[to.lane()].push_back(key.clone());
        self.index.insert(key.clone(), to);
    }
}

impl<K: Clone + Eq + Hash> Default for AdmissionQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
