//! Open-addressed hash map keyed by interned-string identity, used for
//! globals, instance fields, class method tables, and the string intern
//! set itself.
//!
//! Linear probing with tombstones, mask-based indexing over a
//! power-of-two capacity, and a 0.75 max load factor — ported from the
//! original implementation's `hash_map.c`, generalized from its
//! modulo-indexed probe (`find_entry`) to the mask-based scheme this
//! crate standardizes on.

use crate::value::{ObjRef, Value};

const MAX_LOAD_FACTOR: f64 = 0.75;

/// `FNV-1a`, 32-bit: `basis = 2166136261`, `prime = 16777619`.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, value: Value::Nil }
    }
}

#[derive(Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table { count: 0, entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probes for `key`'s bucket. Remembers the first tombstone seen so
    /// a subsequent insert can reuse it instead of running past it.
    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mask = capacity - 1;
        let mut index = (key.as_string().hash as usize) & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut new_entries = vec![Entry::empty(); capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&new_entries, capacity, key);
                new_entries[index] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or overwrites `key`. Returns `true` if `key` was not
    /// already present (a fresh slot, not a reused tombstone).
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            let new_cap = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(new_cap);
        }

        let index = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn contains(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the entry with a tombstone. Does not decrement `count`:
    /// tombstones still count against the load factor so probe chains
    /// stay bounded through repeated delete/insert cycles.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    /// Copies every live entry of `self` into `dest`. Used by `INHERIT`
    /// to copy a superclass's methods into a subclass.
    pub fn copy_into(&self, dest: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                dest.set(key, entry.value);
            }
        }
    }

    /// Byte-equal lookup used during interning: a freshly scanned string
    /// has no identity yet, so it cannot be looked up by `get` (which
    /// compares keys by pointer). Probes by hash, then compares the
    /// candidate's bytes against each live key's bytes.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mask = capacity - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    let s = key.as_string();
                    if s.hash == hash && &*s.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Removes every key whose object is not GC-marked. Used before
    /// sweep to keep the intern table from holding otherwise-unreachable
    /// strings alive (§4.4's weak-interning invariant).
    pub fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    pub fn iter_keys(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.entries.iter().filter_map(|e| e.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_matches_reference_values() {
        // The empty string hashes to the basis.
        assert_eq!(fnv1a_hash(b""), 2166136261);
    }

    #[test]
    fn test_fnv1a_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }
}
