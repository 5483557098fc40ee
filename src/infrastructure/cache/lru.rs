//! Arena-backed LRU list for the memory tier.
//!
//! Nodes live in a `Vec` addressed by stable `u32` ids with a free list for
//! O(1) reuse; the recency order is a doubly-linked list threaded through
//! the arena and a `HashMap` resolves keys to node ids. No locking here:
//! the owning store wraps the whole structure in a single mutex.

use std::collections::HashMap;

use crate::domain::entities::{CacheKey, CachedImage};

/// Sentinel id for "no node".
const NIL: u32 = u32::MAX;

#[derive(Debug)]
struct Node {
    key: CacheKey,
    image: CachedImage,
    cost: u64,
    prev: u32,
    next: u32,
}

/// Intrusive LRU map: most-recently-used at the head, eviction candidates
/// at the tail.
#[derive(Debug)]
pub(crate) struct LruArena {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    map: HashMap<CacheKey, u32>,
    head: u32,
    tail: u32,
    total_cost: u64,
}

impl Default for LruArena {
    fn default() -> Self {
        Self::new()
    }
}

impl LruArena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            head: NIL,
            tail: NIL,
            total_cost: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn total_cost(&self) -> u64 {
        self.total_cost
    }

    fn node(&self, id: u32) -> &Node {
        self.nodes[id as usize].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: u32) -> &mut Node {
        self.nodes[id as usize].as_mut().expect("live node id")
    }

    fn alloc(&mut self, node: Node) -> u32 {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            let id = u32::try_from(self.nodes.len()).expect("arena id overflow");
            self.nodes.push(Some(node));
            id
        }
    }

    fn release(&mut self, id: u32) -> Node {
        let node = self.nodes[id as usize].take().expect("live node id");
        self.free.push(id);
        node
    }

    fn unlink(&mut self, id: u32) {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        let node = self.node_mut(id);
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_head(&mut self, id: u32) {
        let old_head = self.head;
        {
            let node = self.node_mut(id);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = id;
        }
        self.head = id;
        if self.tail == NIL {
            self.tail = id;
        }
    }

    /// Looks a key up and promotes the entry to most-recently-used.
    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<CachedImage> {
        let id = *self.map.get(key)?;
        self.unlink(id);
        self.push_head(id);
        Some(self.node(id).image.clone())
    }

    /// Looks a key up without promoting.
    pub(crate) fn peek(&self, key: &CacheKey) -> Option<&CachedImage> {
        let id = *self.map.get(key)?;
        Some(&self.node(id).image)
    }

    /// Inserts at the head, overwriting an existing entry in place.
    ///
    /// Returns the displaced image, if any, so callers can release it off
    /// the hot path.
    pub(crate) fn insert(
        &mut self,
        key: CacheKey,
        image: CachedImage,
        cost: u64,
    ) -> Option<CachedImage> {
        if let Some(&id) = self.map.get(&key) {
            let node = self.node_mut(id);
            let old_cost = node.cost;
            let old_image = std::mem::replace(&mut node.image, image);
            node.cost = cost;
            self.total_cost = self.total_cost.saturating_sub(old_cost).saturating_add(cost);
            self.unlink(id);
            self.push_head(id);
            Some(old_image)
        } else {
            let id = self.alloc(Node {
                key: key.clone(),
                image,
                cost,
                prev: NIL,
                next: NIL,
            });
            self.map.insert(key, id);
            self.push_head(id);
            self.total_cost = self.total_cost.saturating_add(cost);
            None
        }
    }

    /// Removes a key; returns the image for off-path release.
    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CachedImage> {
        let id = self.map.remove(key)?;
        self.unlink(id);
        let node = self.release(id);
        self.total_cost = self.total_cost.saturating_sub(node.cost);
        Some(node.image)
    }

    /// Evicts the least-recently-used entry.
    pub(crate) fn pop_tail(&mut self) -> Option<(CacheKey, CachedImage)> {
        if self.tail == NIL {
            return None;
        }
        let id = self.tail;
        self.unlink(id);
        let node = self.release(id);
        self.map.remove(&node.key);
        self.total_cost = self.total_cost.saturating_sub(node.cost);
        Some((node.key, node.image))
    }

    /// Keys from most- to least-recently-used.
    #[cfg(test)]
    pub(crate) fn mru_keys(&self) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut id = self.head;
        while id != NIL {
            let node = self.node(id);
            keys.push(node.key.clone());
            id = node.next;
        }
        keys
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let live = self.nodes.iter().filter(|n| n.is_some()).count();
        assert_eq!(live, self.map.len(), "map tracks exactly the live nodes");
        assert_eq!(
            live + self.free.len(),
            self.nodes.len(),
            "every slot is live or free"
        );

        let cost_sum: u64 = self
            .nodes
            .iter()
            .flatten()
            .map(|n| n.cost)
            .fold(0, u64::saturating_add);
        assert_eq!(cost_sum, self.total_cost, "total cost matches residents");

        if self.map.is_empty() {
            assert_eq!(self.head, NIL);
            assert_eq!(self.tail, NIL);
            return;
        }
        assert_eq!(self.node(self.head).prev, NIL, "head has no predecessor");
        assert_eq!(self.node(self.tail).next, NIL, "tail has no successor");

        let mut seen = 0usize;
        let mut id = self.head;
        let mut prev = NIL;
        while id != NIL {
            let node = self.node(id);
            assert_eq!(node.prev, prev, "back pointer agrees with traversal");
            assert_eq!(self.map.get(&node.key), Some(&id), "map points at node");
            prev = id;
            id = node.next;
            seen += 1;
            assert!(seen <= self.map.len(), "list is acyclic");
        }
        assert_eq!(prev, self.tail, "traversal ends at the tail");
        assert_eq!(seen, self.map.len(), "list covers every resident");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use image::DynamicImage;

    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name)
    }

    fn img() -> CachedImage {
        CachedImage::new(Arc::new(DynamicImage::new_rgb8(1, 1)), Bytes::new(), None)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 10);
        assert!(arena.get(&key("a")).is_some());
        assert!(arena.get(&key("b")).is_none());
        arena.assert_invariants();
    }

    #[test]
    fn totals_track_mutations() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 10);
        arena.insert(key("b"), img(), 20);
        assert_eq!(arena.total_cost(), 30);
        assert_eq!(arena.len(), 2);

        arena.remove(&key("a"));
        assert_eq!(arena.total_cost(), 20);
        assert_eq!(arena.len(), 1);
        arena.assert_invariants();
    }

    #[test]
    fn overwrite_updates_cost_by_delta() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 10);
        let displaced = arena.insert(key("a"), img(), 25);
        assert!(displaced.is_some());
        assert_eq!(arena.total_cost(), 25);
        assert_eq!(arena.len(), 1);
        arena.assert_invariants();
    }

    #[test]
    fn get_promotes_to_head() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        arena.insert(key("b"), img(), 1);
        arena.insert(key("c"), img(), 1);
        arena.get(&key("a"));
        assert_eq!(arena.mru_keys(), vec![key("a"), key("c"), key("b")]);
        arena.assert_invariants();
    }

    #[test]
    fn peek_does_not_promote() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        arena.insert(key("b"), img(), 1);
        assert!(arena.peek(&key("a")).is_some());
        assert_eq!(arena.mru_keys(), vec![key("b"), key("a")]);
    }

    #[test]
    fn pop_tail_evicts_least_recently_used() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        arena.insert(key("b"), img(), 1);
        arena.insert(key("c"), img(), 1);

        let (evicted, _) = arena.pop_tail().unwrap();
        assert_eq!(evicted, key("a"));
        assert!(arena.get(&key("a")).is_none());
        arena.assert_invariants();
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        assert!(arena.remove(&key("zzz")).is_none());
        assert_eq!(arena.len(), 1);
        arena.assert_invariants();
    }

    #[test]
    fn single_node_unlink_empties_the_list() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        arena.remove(&key("a"));
        assert_eq!(arena.len(), 0);
        assert!(arena.pop_tail().is_none());
        arena.assert_invariants();
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);
        arena.insert(key("b"), img(), 1);
        arena.remove(&key("a"));
        arena.insert(key("c"), img(), 1);
        // Two inserts and one removal: the arena never grew past two slots.
        assert_eq!(arena.nodes.len(), 2);
        arena.assert_invariants();
    }

    #[test]
    fn taken_arena_leaves_a_usable_empty_one() {
        let mut arena = LruArena::new();
        arena.insert(key("a"), img(), 1);

        let old = std::mem::take(&mut arena);
        assert_eq!(old.len(), 1);
        assert_eq!(arena.len(), 0);

        arena.insert(key("b"), img(), 1);
        assert!(arena.get(&key("b")).is_some());
        arena.assert_invariants();
    }

    #[test]
    fn interleaved_operations_hold_invariants() {
        let mut arena = LruArena::new();
        for i in 0u32..32 {
            arena.insert(key(&format!("k{i}")), img(), u64::from(i));
            if i % 3 == 0 {
                arena.get(&key(&format!("k{}", i / 2)));
            }
            if i % 5 == 0 {
                arena.pop_tail();
            }
            if i % 7 == 0 {
                arena.remove(&key(&format!("k{}", i / 3)));
            }
            arena.assert_invariants();
        }
    }
}
