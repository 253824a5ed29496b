//! Count- and cost-bounded LRU store
//!
//! Entries live in an arena (`Vec` of slots with a free list) and are threaded
//! onto an intrusive doubly-linked list ordered from most- to least-recently
//! used. A `HashMap` maps keys to arena slots, so lookup, promotion, insertion
//! and eviction are all O(1).
//!
//! The store does no locking of its own; `ImageCache` wraps it in a mutex.

use std::collections::HashMap;
use std::hash::Hash;

/// One arena slot
struct Node<K, V> {
    key: K,
    value: V,
    cost: u64,
    /// Towards the most-recently-used end
    prev: Option<usize>,
    /// Towards the least-recently-used end
    next: Option<usize>,
}

/// LRU cache bounded by entry count and by total cost.
///
/// `cost_limit` is a soft target: an entry whose cost alone exceeds it is still
/// admitted, after every other entry has been evicted to make room. The count
/// limit is always honored.
pub struct BoundedCache<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    count_limit: usize,
    cost_limit: u64,
    total_cost: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache. A `count_limit` of zero is treated as one.
    pub fn new(count_limit: usize, cost_limit: u64) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            count_limit: count_limit.max(1),
            cost_limit,
            total_cost: 0,
        }
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.detach(slot);
        self.attach_front(slot);
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    /// Look up an entry without touching its recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or replace an entry.
    ///
    /// Least-recently-used entries are evicted until the new entry fits both
    /// limits. A previous value under the same key is replaced, not reported as
    /// evicted. Returns the evicted entries, oldest first.
    pub fn put(&mut self, key: K, value: V, cost: u64) -> Vec<(K, V)> {
        self.remove(&key);

        let mut evicted = Vec::new();
        while !self.index.is_empty()
            && (self.index.len() + 1 > self.count_limit
                || self.total_cost.saturating_add(cost) > self.cost_limit)
        {
            match self.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        let node = Node {
            key: key.clone(),
            value,
            cost,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.attach_front(slot);
        self.index.insert(key, slot);
        self.total_cost += cost;

        evicted
    }

    /// Remove an entry, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.release(slot).map(|(_, value)| value)
    }

    /// Remove and return the least-recently-used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        let node_key = self.slots[slot].as_ref()?.key.clone();
        self.index.remove(&node_key);
        self.release(slot)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.index.len();
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_cost = 0;
        removed
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sum of the costs of all resident entries
    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn count_limit(&self) -> usize {
        self.count_limit
    }

    pub fn cost_limit(&self) -> u64 {
        self.cost_limit
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match self.slots[slot].as_ref() {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }

    /// Unlink a slot and return it to the free list
    fn release(&mut self, slot: usize) -> Option<(K, V)> {
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        self.total_cost = self.total_cost.saturating_sub(node.cost);
        Some((node.key, node.value))
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_mut() {
            Some(node) => {
                let links = (node.prev, node.next);
                node.prev = None;
                node.next = None;
                links
            }
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None if self.head == Some(slot) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None if self.tail == Some(slot) => self.tail = prev,
            None => {}
        }
    }

    fn attach_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.slots[h].as_mut() {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("len", &self.index.len())
            .field("count_limit", &self.count_limit)
            .field("total_cost", &self.total_cost)
            .field("cost_limit", &self.cost_limit)
            .finish()
    }
}
