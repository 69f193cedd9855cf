//! Insertion-ordered, deduplicating result set keyed by a 64-bit value.

use std::collections::HashMap;

/// Unique `u64` keys in first-insertion order, each carrying an auxiliary
/// payload. Re-adding a key merges payloads instead of replacing them.
///
/// Iteration by index stays valid while entries are appended, which lets a
/// `UList` serve as its own breadth-first work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UList<T> {
    entries: Vec<(u64, T)>,
    index: HashMap<u64, usize>,
}

impl<T> Default for UList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> UList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, val: u64) -> bool {
        self.index.contains_key(&val)
    }

    #[must_use]
    pub fn get(&self, val: u64) -> Option<&T> {
        self.index.get(&val).map(|&i| &self.entries[i].1)
    }

    /// Add `val` if absent. Returns `true` when the key is new; an existing
    /// entry keeps its payload.
    pub fn add(&mut self, val: u64, aux: T) -> bool {
        self.add_merge(val, aux, |_, _| {})
    }

    /// Add `val`, or fold `aux` into the existing payload with `merge`.
    /// Returns `true` when the key is new.
    pub fn add_merge(&mut self, val: u64, aux: T, merge: impl FnOnce(&mut T, T)) -> bool {
        if let Some(&i) = self.index.get(&val) {
            merge(&mut self.entries[i].1, aux);
            return false;
        }
        self.index.insert(val, self.entries.len());
        self.entries.push((val, aux));
        true
    }

    /// The entry at insertion position `idx`.
    #[must_use]
    pub fn entry_at(&self, idx: usize) -> Option<(u64, &T)> {
        self.entries.get(idx).map(|(val, aux)| (*val, aux))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        self.entries.iter().map(|(val, aux)| (*val, aux))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|(val, _)| *val)
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<(u64, T)> {
        self.entries
    }
}

impl<T> FromIterator<(u64, T)> for UList<T> {
    fn from_iter<I: IntoIterator<Item = (u64, T)>>(iter: I) -> Self {
        let mut list = Self::new();
        for (val, aux) in iter {
            list.add(val, aux);
        }
        list
    }
}
