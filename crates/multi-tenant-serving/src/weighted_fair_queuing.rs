//! Weighted Fair Queuing (WFQ) Module
//!
//! Orders waiting requests across tenants by virtual finish time so each
//! tenant receives dispatch bandwidth proportional to its weight, no matter
//! how many requests other tenants enqueue.
//!
//! On enqueue an entry is stamped with
//! `max(tenant's last finish, global virtual time) + cost / weight`.
//! Dequeue returns the smallest stamp and advances global virtual time to it.
//! Ties are broken by arrival time, then tenant id, then submission order, so
//! ordering is deterministic and each tenant's entries stay FIFO.
//!
//! The queue is a plain data structure; callers wrap it in a single lock.
//! Every operation is O(log n), except `take_where`, which also walks the
//! entries its predicate skips.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use crate::types::{Cost, RequestId, TenantId};

/// Virtual time with a total order
#[derive(Debug, Clone, Copy, PartialEq)]
struct VirtualTime(f64);

impl Eq for VirtualTime {}

impl Ord for VirtualTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for VirtualTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    finish: VirtualTime,
    arrived_at: Instant,
    tenant_id: TenantId,
    seq: u64,
}

/// WFQ queue entry
#[derive(Debug)]
pub struct FairQueueEntry<T> {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub cost: Cost,
    pub weight: u32,
    pub virtual_finish_time: f64,
    pub arrived_at: Instant,
    pub payload: T,
    seq: u64,
}

impl<T> FairQueueEntry<T> {
    fn key(&self) -> QueueKey {
        QueueKey {
            finish: VirtualTime(self.virtual_finish_time),
            arrived_at: self.arrived_at,
            tenant_id: self.tenant_id.clone(),
            seq: self.seq,
        }
    }
}

/// WFQ statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WFQStats {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_removed: u64,
    pub queue_depth: u64,
    pub peak_depth: u64,
    pub virtual_time: f64,
}

#[derive(Debug)]
pub struct WeightedFairQueue<T> {
    entries: BTreeMap<QueueKey, FairQueueEntry<T>>,
    index: HashMap<RequestId, QueueKey>,
    last_finish: HashMap<TenantId, f64>,
    pending: HashMap<TenantId, usize>,
    virtual_time: f64,
    next_seq: u64,
    stats: WFQStats,
}

impl<T> WeightedFairQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            last_finish: HashMap::new(),
            pending: HashMap::new(),
            virtual_time: 0.0,
            next_seq: 0,
            stats: WFQStats::default(),
        }
    }

    /// Enqueue a request and return its virtual finish time.
    ///
    /// `weight` must be positive and `cost` finite and positive; the caller
    /// validates both.
    pub fn enqueue(
        &mut self,
        request_id: RequestId,
        tenant_id: &str,
        cost: Cost,
        weight: u32,
        arrived_at: Instant,
        payload: T,
    ) -> f64 {
        debug_assert!(weight > 0);
        let start = self
            .last_finish
            .get(tenant_id)
            .copied()
            .unwrap_or(self.virtual_time)
            .max(self.virtual_time);
        let virtual_finish_time = start + cost / f64::from(weight);
        self.last_finish
            .insert(tenant_id.to_string(), virtual_finish_time);

        let entry = FairQueueEntry {
            request_id,
            tenant_id: tenant_id.to_string(),
            cost,
            weight,
            virtual_finish_time,
            arrived_at,
            payload,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.insert(entry);
        self.stats.total_enqueued += 1;

        virtual_finish_time
    }

    /// Put a previously dequeued entry back with its original position
    pub fn requeue(&mut self, entry: FairQueueEntry<T>) {
        self.insert(entry);
    }

    /// Remove the entry with the smallest virtual finish time and advance
    /// global virtual time to it
    pub fn dequeue(&mut self) -> Option<FairQueueEntry<T>> {
        let (_, entry) = self.entries.pop_first()?;
        self.detach(&entry);
        self.mark_served(&entry);
        Some(entry)
    }

    /// Take the first entry in queue order that matches `predicate` without
    /// advancing virtual time. Hand it back with [`requeue`](Self::requeue) or
    /// charge it with [`mark_served`](Self::mark_served).
    pub fn take_where<F>(&mut self, mut predicate: F) -> Option<FairQueueEntry<T>>
    where
        F: FnMut(&FairQueueEntry<T>) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())?;
        let entry = self.entries.remove(&key)?;
        self.detach(&entry);
        Some(entry)
    }

    /// Advance global virtual time to an entry taken with `take_where` that
    /// is being served
    pub fn mark_served(&mut self, entry: &FairQueueEntry<T>) {
        if entry.virtual_finish_time > self.virtual_time {
            self.virtual_time = entry.virtual_finish_time;
        }
        // A tenant whose last finish has been reached needs no memory
        if self
            .last_finish
            .get(&entry.tenant_id)
            .is_some_and(|last| *last <= self.virtual_time)
            && !self.pending.contains_key(&entry.tenant_id)
        {
            self.last_finish.remove(&entry.tenant_id);
        }

        self.stats.total_dequeued += 1;
        self.stats.virtual_time = self.virtual_time;
    }

    pub fn peek(&self) -> Option<&FairQueueEntry<T>> {
        self.entries.first_key_value().map(|(_, entry)| entry)
    }

    /// Remove exactly one entry; other entries keep their positions
    pub fn remove(&mut self, request_id: &RequestId) -> Option<FairQueueEntry<T>> {
        let key = self.index.get(request_id)?.clone();
        let entry = self.entries.remove(&key)?;
        self.detach(&entry);
        self.stats.total_removed += 1;
        Some(entry)
    }

    /// Remove every entry matching `predicate`, in queue order
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<FairQueueEntry<T>>
    where
        F: FnMut(&FairQueueEntry<T>) -> bool,
    {
        let ids: Vec<RequestId> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.request_id)
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove everything, in queue order
    pub fn drain(&mut self) -> Vec<FairQueueEntry<T>> {
        let drained: Vec<_> = std::mem::take(&mut self.entries).into_values().collect();
        self.stats.total_removed += drained.len() as u64;
        self.index.clear();
        self.pending.clear();
        self.stats.queue_depth = 0;
        drained
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.index.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries waiting for `tenant_id`
    pub fn tenant_depth(&self, tenant_id: &str) -> usize {
        self.pending.get(tenant_id).copied().unwrap_or(0)
    }

    pub fn virtual_time(&self) -> f64 {
        self.virtual_time
    }

    pub fn stats(&self) -> WFQStats {
        self.stats.clone()
    }

    fn insert(&mut self, entry: FairQueueEntry<T>) {
        let key = entry.key();
        *self.pending.entry(entry.tenant_id.clone()).or_insert(0) += 1;
        self.index.insert(entry.request_id, key.clone());
        self.entries.insert(key, entry);

        self.stats.queue_depth = self.entries.len() as u64;
        self.stats.peak_depth = self.stats.peak_depth.max(self.stats.queue_depth);
    }

    fn detach(&mut self, entry: &FairQueueEntry<T>) {
        self.index.remove(&entry.request_id);
        if let Some(count) = self.pending.get_mut(&entry.tenant_id) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&entry.tenant_id);
            }
        }
        self.stats.queue_depth = self.entries.len() as u64;
    }
}

impl<T> Default for WeightedFairQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn drain_order(queue: &mut WeightedFairQueue<()>) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue())
            .map(|entry| entry.tenant_id)
            .collect()
    }

    #[test]
    fn test_single_tenant_is_fifo() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        let ids: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
        for id in &ids {
            queue.enqueue(*id, "a", 1.0, 1, now, ());
        }

        let dequeued: Vec<RequestId> = std::iter::from_fn(|| queue.dequeue())
            .map(|entry| entry.request_id)
            .collect();
        assert_eq!(dequeued, ids);
    }

    #[test]
    fn test_weights_interleave_two_to_one() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        for _ in 0..4 {
            queue.enqueue(RequestId::new(), "a", 1.0, 2, now, ());
        }
        for _ in 0..2 {
            queue.enqueue(RequestId::new(), "b", 1.0, 1, now, ());
        }

        assert_eq!(drain_order(&mut queue), vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn test_flooding_tenant_cannot_starve_another() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        for _ in 0..1_000 {
            queue.enqueue(RequestId::new(), "flood", 1.0, 1, now, ());
        }
        let late = now + std::time::Duration::from_millis(1);
        queue.enqueue(RequestId::new(), "quiet", 1.0, 1, late, ());

        let position = drain_order(&mut queue)
            .iter()
            .position(|tenant| tenant == "quiet")
            .unwrap();
        assert!(position <= 1, "quiet tenant served at position {position}");
    }

    #[test]
    fn test_equal_weights_share_evenly() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        for tenant in ["a", "b", "c"] {
            for _ in 0..100 {
                queue.enqueue(RequestId::new(), tenant, 1.0, 1, now, ());
            }
        }

        let first_window: Vec<String> = (0..30)
            .filter_map(|_| queue.dequeue())
            .map(|e| e.tenant_id)
            .collect();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for tenant in first_window {
            *counts.entry(tenant).or_default() += 1;
        }
        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 10);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn test_idle_tenant_does_not_bank_credit() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        for _ in 0..10 {
            queue.enqueue(RequestId::new(), "busy", 1.0, 1, now, ());
        }
        for _ in 0..5 {
            queue.dequeue();
        }
        // Joins at the current virtual time rather than at zero
        let finish = queue.enqueue(RequestId::new(), "late", 1.0, 1, now, ());
        assert_eq!(finish, queue.virtual_time() + 1.0);
    }

    #[test]
    fn test_tie_breaks_by_arrival_then_tenant() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        let later = now + std::time::Duration::from_millis(1);
        queue.enqueue(RequestId::new(), "z", 1.0, 1, later, ());
        queue.enqueue(RequestId::new(), "y", 1.0, 1, now, ());
        queue.enqueue(RequestId::new(), "x", 1.0, 1, now, ());

        assert_eq!(drain_order(&mut queue), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_remove_keeps_other_order() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        let a1 = RequestId::new();
        let b1 = RequestId::new();
        let a2 = RequestId::new();
        queue.enqueue(a1, "a", 1.0, 1, now, ());
        queue.enqueue(b1, "b", 1.0, 1, now, ());
        queue.enqueue(a2, "a", 1.0, 1, now, ());

        let removed = queue.remove(&b1).unwrap();
        assert_eq!(removed.tenant_id, "b");
        assert!(queue.remove(&b1).is_none());
        assert_eq!(queue.tenant_depth("b"), 0);

        let rest: Vec<RequestId> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.request_id)
            .collect();
        assert_eq!(rest, vec![a1, a2]);
    }

    #[test]
    fn test_requeue_restores_position() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        let first = RequestId::new();
        queue.enqueue(first, "a", 1.0, 1, now, ());
        queue.enqueue(RequestId::new(), "b", 1.0, 1, now, ());

        let entry = queue.dequeue().unwrap();
        assert_eq!(entry.request_id, first);
        queue.requeue(entry);

        assert_eq!(queue.peek().unwrap().request_id, first);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_where_and_drain() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        for i in 0..6u32 {
            queue.enqueue(RequestId::new(), "a", 1.0, 1, now, i);
        }

        let odd = queue.remove_where(|entry| entry.payload % 2 == 1);
        assert_eq!(odd.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(queue.len(), 3);

        let rest = queue.drain();
        assert_eq!(rest.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.tenant_depth("a"), 0);

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 6);
        assert_eq!(stats.total_removed, 6);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.peak_depth, 6);
    }

    #[test]
    fn test_cost_scales_virtual_finish() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        let heavy = queue.enqueue(RequestId::new(), "a", 4.0, 2, now, ());
        let light = queue.enqueue(RequestId::new(), "b", 1.0, 1, now, ());
        assert_eq!(heavy, 2.0);
        assert_eq!(light, 1.0);
        assert_eq!(queue.dequeue().unwrap().tenant_id, "b");
    }

    #[test]
    fn test_take_where_skips_without_advancing_virtual_time() {
        let mut queue = WeightedFairQueue::new();
        let now = Instant::now();
        queue.enqueue(RequestId::new(), "a", 1.0, 1, now, ());
        queue.enqueue(RequestId::new(), "a", 1.0, 1, now, ());
        queue.enqueue(RequestId::new(), "b", 3.0, 1, now, ());

        let taken = queue
            .take_where(|entry| entry.tenant_id != "a")
            .unwrap();
        assert_eq!(taken.tenant_id, "b");
        assert_eq!(queue.virtual_time(), 0.0);
        assert_eq!(queue.len(), 2);

        // Put back, the skipped tenant is still first in line
        queue.requeue(taken);
        assert_eq!(queue.virtual_time(), 0.0);
        let head = queue.take_where(|_| true).unwrap();
        assert_eq!(head.tenant_id, "a");

        queue.mark_served(&head);
        assert_eq!(queue.virtual_time(), 1.0);
        assert_eq!(queue.stats().total_dequeued, 1);
        assert!(queue.take_where(|entry| entry.tenant_id == "c").is_none());
    }
}
