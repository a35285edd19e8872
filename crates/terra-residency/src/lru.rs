//! Access-ordered map.
//!
//! Hash index over a slab of doubly linked nodes. The list runs from most
//! recently used (head) to least recently used (tail); every operation is
//! O(1) except iteration.

use ahash::AHashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Map that remembers the order in which entries were last used.
#[derive(Debug)]
pub struct LruMap<K, V> {
    index: AHashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K, V> Default for LruMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LruMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: AHashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Checks if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Looks up an entry without changing its position.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|n| &n.value)
    }

    /// Looks up an entry mutably without changing its position.
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_mut().map(|n| &mut n.value)
    }

    /// Looks up an entry and makes it the most recently used.
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.move_to_front(idx);
        self.slots[idx].as_mut().map(|n| &mut n.value)
    }

    /// Makes `key` the most recently used. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.move_to_front(idx);
                true
            },
            None => false,
        }
    }

    /// Inserts or replaces an entry as the most recently used, returning
    /// the replaced value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            self.move_to_front(idx);
            return self.slots[idx]
                .as_mut()
                .map(|n| std::mem::replace(&mut n.value, value));
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            },
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            },
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        None
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|n| n.value)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.unlink(idx);
        self.free.push(idx);
        let node = self.slots[idx].take()?;
        self.index.remove(&node.key);
        Some((node.key, node.value))
    }

    /// Least recently used entry.
    #[must_use]
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        let node = self.slots[self.tail?].as_ref()?;
        Some((&node.key, &node.value))
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    /// Visits every value mutably, in no particular order.
    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&K, &mut V)) {
        for node in self.slots.iter_mut().flatten() {
            f(&node.key, &mut node.value);
        }
    }

    /// Removes every entry, least recently used first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop_lru() {
            out.push(entry);
        }
        out
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].as_mut() {
                    n.next = next;
                }
            },
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.slots[nx].as_mut() {
                    n.prev = prev;
                }
            },
            None => self.tail = prev,
        }
        if let Some(n) = self.slots[idx].as_mut() {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(n) = self.slots[idx].as_mut() {
            n.prev = None;
            n.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(n) = self.slots[h].as_mut() {
                    n.prev = Some(idx);
                }
            },
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }
}

/// Iterator from most to least recently used.
pub struct Iter<'a, K, V> {
    map: &'a LruMap<K, V>,
    cursor: Option<usize>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.map.slots[self.cursor?].as_ref()?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}
