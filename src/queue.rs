//! Bounded in-memory retry queue
//!
//! Entries live in an arena keyed by a monotonically increasing [`EntryId`]
//! assigned at first enqueue. The `BTreeMap` order doubles as the age index
//! for oldest-first eviction; a second map gives lookup by event id.
//! Nothing survives a process restart.

use crate::types::AuditEvent;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Queue-assigned identity; lower ids are older
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

/// An audit event awaiting redelivery
#[derive(Debug, Clone)]
pub struct RetryEntry {
    id: Option<EntryId>,
    event: AuditEvent,
    /// Failed drain attempts so far
    pub attempts: u32,
    /// Earliest time the entry may be retried
    pub next_eligible: Instant,
    /// When immediate delivery first failed
    pub first_failed_at: Instant,
    /// Most recent failure message
    pub last_error: String,
}

impl RetryEntry {
    /// Wrap an event whose immediate delivery just failed
    pub fn new(event: AuditEvent, next_eligible: Instant, error: impl Into<String>) -> Self {
        Self {
            id: None,
            event,
            attempts: 0,
            next_eligible,
            first_failed_at: Instant::now(),
            last_error: error.into(),
        }
    }

    /// Queue id, present once the entry has been enqueued
    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    pub fn event(&self) -> &AuditEvent {
        &self.event
    }

    pub fn into_event(self) -> AuditEvent {
        self.event
    }
}

/// What happened to an enqueued entry
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Stored without displacing anything
    Queued,
    /// Stored after evicting the oldest entry, which is returned
    Evicted(RetryEntry),
    /// The same event was already queued; its retry state absorbed the new
    /// entry's (higher attempt count, later eligibility)
    Merged,
}

#[derive(Default)]
struct Slots {
    entries: BTreeMap<EntryId, RetryEntry>,
    by_event: HashMap<String, EntryId>,
}

impl Slots {
    fn remove(&mut self, id: EntryId) -> Option<RetryEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_event.remove(entry.event.id());
        Some(entry)
    }
}

/// Thread-safe bounded retry queue with oldest-first eviction
pub struct RetryQueue {
    slots: Mutex<Slots>,
    max_size: usize,
    next_id: AtomicU64,
    /// Metrics: total entries ever stored
    total_enqueued: AtomicU64,
    /// Metrics: entries evicted due to capacity
    total_evicted: AtomicU64,
}

impl RetryQueue {
    /// Create a queue holding at most `max_size` entries (minimum 1)
    pub fn new(max_size: usize) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            max_size: max_size.max(1),
            next_id: AtomicU64::new(0),
            total_enqueued: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// Store an entry, evicting the oldest one when full
    ///
    /// Re-enqueued entries keep their original id and therefore their age.
    /// An entry for an event that is already queued never resets its retry
    /// budget: the two are merged into the queued slot.
    pub fn enqueue(&self, mut entry: RetryEntry) -> EnqueueOutcome {
        let mut slots = self.slots.lock();

        let existing = slots.by_event.get(entry.event.id()).copied();
        if let Some(queued) = existing.and_then(|id| slots.entries.get_mut(&id)) {
            if entry.attempts > queued.attempts {
                queued.attempts = entry.attempts;
                queued.last_error = entry.last_error;
            }
            queued.next_eligible = queued.next_eligible.max(entry.next_eligible);
            queued.first_failed_at = queued.first_failed_at.min(entry.first_failed_at);
            return EnqueueOutcome::Merged;
        }

        let evicted = if slots.entries.len() >= self.max_size {
            let oldest = slots.entries.keys().next().copied();
            oldest.and_then(|id| slots.remove(id))
        } else {
            None
        };

        let id = *entry
            .id
            .get_or_insert_with(|| EntryId(self.next_id.fetch_add(1, Ordering::Relaxed)));
        slots.by_event.insert(entry.event.id().to_string(), id);
        slots.entries.insert(id, entry);
        drop(slots);

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        match evicted {
            Some(entry) => {
                self.total_evicted.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Evicted(entry)
            }
            None => EnqueueOutcome::Queued,
        }
    }

    /// Remove and return every entry eligible at `now`, oldest first
    pub fn drain_due(&self, now: Instant) -> Vec<RetryEntry> {
        let mut slots = self.slots.lock();
        let due: Vec<EntryId> = slots
            .entries
            .iter()
            .filter(|(_, entry)| entry.next_eligible <= now)
            .map(|(id, _)| *id)
            .collect();

        due.into_iter().filter_map(|id| slots.remove(id)).collect()
    }

    /// Earliest eligibility time among queued entries
    pub fn next_due(&self) -> Option<Instant> {
        let slots = self.slots.lock();
        slots.entries.values().map(|entry| entry.next_eligible).min()
    }

    /// Whether an event is currently queued
    pub fn contains(&self, event_id: &str) -> bool {
        self.slots.lock().by_event.contains_key(event_id)
    }

    /// Copy of all queued entries, oldest first
    pub fn snapshot(&self) -> Vec<RetryEntry> {
        self.slots.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued.load(Ordering::Relaxed)
    }

    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(action: &str, next_eligible: Instant) -> RetryEntry {
        RetryEntry::new(
            AuditEvent::new("user:test", action, serde_json::json!({})),
            next_eligible,
            "store down",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_and_drain_due() {
        let queue = RetryQueue::new(10);
        let now = Instant::now();

        let due = entry("a", now);
        let later = entry("b", now + Duration::from_secs(5));
        let due_id = due.event().id().to_string();

        assert!(matches!(queue.enqueue(due), EnqueueOutcome::Queued));
        assert!(matches!(queue.enqueue(later), EnqueueOutcome::Queued));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain_due(now);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event().id(), due_id);
        assert_eq!(queue.len(), 1);
        assert!(!queue.contains(&due_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_nothing_due_is_noop() {
        let queue = RetryQueue::new(10);
        let now = Instant::now();
        queue.enqueue(entry("a", now + Duration::from_secs(1)));

        assert!(queue.drain_due(now).is_empty());
        assert_eq!(queue.len(), 1);
        assert!(RetryQueue::new(4).drain_due(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_evicts_oldest() {
        let queue = RetryQueue::new(3);
        let now = Instant::now();

        let first = entry("first", now);
        let first_id = first.event().id().to_string();
        queue.enqueue(first);
        queue.enqueue(entry("second", now));
        queue.enqueue(entry("third", now));

        match queue.enqueue(entry("fourth", now)) {
            EnqueueOutcome::Evicted(evicted) => assert_eq!(evicted.event().id(), first_id),
            other => panic!("expected eviction, got {:?}", other),
        }

        assert_eq!(queue.len(), 3);
        assert!(!queue.contains(&first_id));
        assert_eq!(queue.total_evicted(), 1);
        assert_eq!(queue.total_enqueued(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_entry_keeps_its_age() {
        let queue = RetryQueue::new(2);
        let now = Instant::now();

        let old = entry("old", now);
        let old_id = old.event().id().to_string();
        queue.enqueue(old);
        queue.enqueue(entry("young", now + Duration::from_secs(60)));

        let mut drained = queue.drain_due(now);
        let mut old = drained.pop().unwrap();
        old.attempts += 1;
        old.next_eligible = now + Duration::from_secs(1);
        queue.enqueue(old);

        // Still the oldest, so it goes first
        match queue.enqueue(entry("newest", now)) {
            EnqueueOutcome::Evicted(evicted) => assert_eq!(evicted.event().id(), old_id),
            other => panic!("expected eviction, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_event_not_stored_twice() {
        let queue = RetryQueue::new(10);
        let original = entry("a", Instant::now());
        let copy = original.clone();

        queue.enqueue(original);
        assert!(matches!(queue.enqueue(copy), EnqueueOutcome::Merged));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.total_enqueued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keeps_retry_budget() {
        let queue = RetryQueue::new(10);
        let now = Instant::now();

        // A fresh copy was logged while the drain was retrying the original
        let retried = entry("a", now);
        let fresh = RetryEntry::new(
            retried.event().clone(),
            now + Duration::from_millis(250),
            "down",
        );
        queue.enqueue(fresh);

        let mut retried = retried;
        retried.attempts = 3;
        retried.next_eligible = now + Duration::from_secs(2);
        retried.last_error = "timeout".into();
        assert!(matches!(queue.enqueue(retried), EnqueueOutcome::Merged));

        let queued = queue.snapshot().remove(0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queued.attempts, 3);
        assert_eq!(queued.last_error, "timeout");
        assert_eq!(queued.next_eligible, now + Duration::from_secs(2));

        // A lower count never rolls the budget back
        let stale = RetryEntry::new(queued.event().clone(), now, "down");
        queue.enqueue(stale);
        let queued = queue.snapshot().remove(0);
        assert_eq!(queued.attempts, 3);
        assert_eq!(queued.next_eligible, now + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_oldest_first() {
        let queue = RetryQueue::new(10);
        let now = Instant::now();
        for action in ["a", "b", "c"] {
            queue.enqueue(entry(action, now));
        }

        let actions: Vec<String> = queue
            .drain_due(now)
            .iter()
            .map(|e| e.event().action().to_string())
            .collect();
        assert_eq!(actions, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_due() {
        let queue = RetryQueue::new(10);
        assert!(queue.next_due().is_none());

        let now = Instant::now();
        queue.enqueue(entry("a", now + Duration::from_secs(9)));
        queue.enqueue(entry("b", now + Duration::from_secs(3)));
        assert_eq!(queue.next_due(), Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_concurrent_enqueue() {
        let queue = std::sync::Arc::new(RetryQueue::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.enqueue(entry(&format!("t{}-{}", t, i), Instant::now()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
        assert_eq!(queue.snapshot().len(), 400);
    }
}
