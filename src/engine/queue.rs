//! Bounded containers shared by every stage. All of them evict oldest-first.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after dropping the oldest queued entry.
    Evicted,
    Closed,
}

/// Multi-producer queue with drop-oldest overflow. A push never blocks beyond
/// the short critical section of the inner lock.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: AtomicUsize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let cap = self.capacity.load(Ordering::Relaxed);
        let mut q = self.inner.lock();
        let mut outcome = PushOutcome::Accepted;
        while q.len() >= cap {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            outcome = PushOutcome::Evicted;
        }
        q.push_back(item);
        outcome
    }

    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Shrinking below the current length evicts on the next push.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops intake and discards whatever is queued. Returns the discarded count.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut q = self.inner.lock();
        let n = q.len();
        q.clear();
        q.shrink_to_fit();
        n
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Insertion-ordered map with a hard size cap. Re-inserting an existing key
/// updates its value without refreshing its position.
#[derive(Debug, Clone)]
pub struct RecencyMap<K, V> {
    order: VecDeque<K>,
    entries: AHashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> RecencyMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), entries: AHashMap::new(), capacity: capacity.max(1) }
    }

    /// Returns how many entries were evicted to make room.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return 0;
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        self.evict()
    }

    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        self.evict()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Append-only ring used for conflict, gap and error histories.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Returns the pruned entry, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_queue_drops_oldest() {
        let q = BoundedQueue::new(2);
        assert_eq!(q.push(1), PushOutcome::Accepted);
        assert_eq!(q.push(2), PushOutcome::Accepted);
        assert_eq!(q.push(3), PushOutcome::Evicted);
        assert_eq!(q.drain(), vec![2, 3]);
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn test_queue_close_discards() {
        let q = BoundedQueue::new(4);
        q.push("a");
        q.push("b");
        assert_eq!(q.close(), 2);
        assert_eq!(q.push("c"), PushOutcome::Closed);
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_concurrent_producers_bounded() {
        let q = Arc::new(BoundedQueue::new(100));
        crossbeam::scope(|s| {
            for t in 0..4 {
                let q = Arc::clone(&q);
                s.spawn(move |_| {
                    for i in 0..1000 {
                        q.push(t * 1000 + i);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(q.len(), 100);
        assert_eq!(q.dropped_count(), 3900);
    }

    #[test]
    fn test_recency_map_evicts_oldest() {
        let mut m = RecencyMap::new(2);
        assert_eq!(m.insert("a", 1), 0);
        m.insert("b", 2);
        assert_eq!(m.insert("a", 10), 0); // update in place
        assert_eq!(m.insert("c", 3), 1);
        assert!(!m.contains(&"a"));
        assert_eq!(m.get(&"b"), Some(&2));
        assert_eq!(m.get(&"c"), Some(&3));
    }

    #[test]
    fn test_history_prunes_oldest() {
        let mut h = BoundedHistory::new(3);
        for i in 0..5 {
            h.push(i);
        }
        assert_eq!(h.to_vec(), vec![2, 3, 4]);
    }
}
