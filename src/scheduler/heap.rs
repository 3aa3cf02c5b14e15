//! Binary min-heap with a key index, so entries can be looked up, re-ordered
//! in place and removed from the middle in `O(log n)`.

use std::collections::HashMap;
use std::hash::Hash;

/// An entry that can live in an [`IndexedHeap`].
pub(crate) trait HeapItem {
    type Key: Copy + Eq + Hash;

    fn key(&self) -> Self::Key;

    /// Whether `self` comes out of the heap before `other`.
    fn less(&self, other: &Self) -> bool;
}

#[derive(Debug)]
pub(crate) struct IndexedHeap<T: HeapItem> {
    items: Vec<T>,
    positions: HashMap<T::Key, usize>,
}

impl<T: HeapItem> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<T: HeapItem> IndexedHeap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn get(&self, key: T::Key) -> Option<&T> {
        self.positions.get(&key).map(|&pos| &self.items[pos])
    }

    /// Current slot of `key` in the backing array; `0` is the root.
    pub fn position(&self, key: T::Key) -> Option<usize> {
        self.positions.get(&key).copied()
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.positions.contains_key(&key)
    }

    /// Inserts `item`, replacing any entry with the same key.
    pub fn push(&mut self, item: T) {
        let key = item.key();
        if let Some(&pos) = self.positions.get(&key) {
            self.items[pos] = item;
            self.fix(pos);
            return;
        }
        let pos = self.items.len();
        self.items.push(item);
        self.positions.insert(key, pos);
        self.sift_up(pos);
    }

    /// Mutates the entry for `key` and restores heap order. Returns `false`
    /// when there is no such entry. `f` must not change the key.
    pub fn update<F: FnOnce(&mut T)>(&mut self, key: T::Key, f: F) -> bool {
        let Some(&pos) = self.positions.get(&key) else {
            return false;
        };
        f(&mut self.items[pos]);
        debug_assert!(self.items[pos].key() == key, "heap entry key changed");
        self.fix(pos);
        true
    }

    /// Removes the entry for `key`, returning the slot it occupied and the
    /// entry itself.
    pub fn remove(&mut self, key: T::Key) -> Option<(usize, T)> {
        let pos = self.positions.remove(&key)?;
        let last = self.items.len() - 1;
        if pos != last {
            self.items.swap(pos, last);
            let moved = self.items[pos].key();
            self.positions.insert(moved, pos);
        }
        let item = self.items.pop()?;
        if pos < self.items.len() {
            self.fix(pos);
        }
        Some((pos, item))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.positions.clear();
    }

    /// Entries in backing-array order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    fn fix(&mut self, pos: usize) {
        if !self.sift_down(pos) {
            self.sift_up(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.items[pos].less(&self.items[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.items.len();
        let mut pos = start;
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.items[right].less(&self.items[left]) {
                child = right;
            }
            if !self.items[child].less(&self.items[pos]) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos > start
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.positions.insert(self.items[a].key(), a);
        self.positions.insert(self.items[b].key(), b);
    }
}
