//! Open-addressing hash table keyed by `Value`.
//!
//! Linear probing over a power-of-two bucket array. A bucket is *empty*
//! (empty-sentinel key, nil value), a *tombstone* (empty-sentinel key, `true`
//! value), or live. Probes stop at the first empty bucket; deletions write
//! tombstones so later probe sequences stay intact, and insertions reuse the
//! first tombstone seen. Resize at 75% load, growing to `max(8, cap * 2)`.
//!
//! The same table backs globals, the STL, class method/static tables,
//! instance fields, the per-chunk constant dedup map, user hashmaps, and —
//! through the byte-comparing `find_string` lookup — the string intern set
//! that makes pointer equality mean value equality for strings.

use crate::Value;
use crate::object::{GcRef, ObjString};
use crate::values_equal;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

pub fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 { 8 } else { capacity * 2 }
}

/// FNV-1a over a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

fn hash_value(value: Value) -> u32 {
    if value.is_nil() {
        5
    } else if value.is_bool() {
        if value.as_bool() { 3 } else { 7 }
    } else if value.is_number() {
        // Normalize the zero sign so values that compare equal hash equally.
        let n = value.as_number();
        let n = if n == 0.0 { 0.0 } else { n };
        hash_bytes(&n.to_bits().to_le_bytes())
    } else if value.is_obj() {
        let obj = value.as_obj();
        if obj.kind() == crate::object::ObjKind::String {
            obj.as_string().hash
        } else {
            let addr = obj.as_ptr() as usize as u64;
            (addr as u32).wrapping_add((addr >> 32) as u32)
        }
    } else {
        // The empty sentinel is never used as a lookup key.
        0
    }
}

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: Value::empty(),
            value: Value::nil(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_empty() && self.value.is_bool()
    }
}

pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index of the entry for `key`: the live match, or the first tombstone
    /// seen, or the terminating empty bucket. Requires non-zero capacity.
    fn find(entries: &[Entry], key: Value) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash_value(key) as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_empty() {
                if !entry.value.is_bool() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if values_equal(entry.key, key) {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::vacant(); capacity];
        // Tombstones are dropped on the way over, so recount.
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_empty() {
                continue;
            }
            let dest = Self::find(&entries, entry.key);
            entries[dest] = *entry;
            self.count += 1;
        }
        self.entries = entries;
    }

    /// Inserts or overwrites; returns whether the key was new.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            let capacity = grow_capacity(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = Self::find(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_empty() && !entry.value.is_bool();
        if is_new {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[Self::find(&self.entries, key)];
        if entry.key.is_empty() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Replaces the entry with a tombstone; returns whether it existed.
    pub fn delete(&mut self, key: Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_empty() {
            return false;
        }
        entry.key = Value::empty();
        entry.value = Value::boolean(true);
        true
    }

    /// Copies every live entry into `to`, overwriting colliding keys.
    pub fn add_all_to(&self, to: &mut Table) {
        for entry in &self.entries {
            if !entry.key.is_empty() {
                to.set(entry.key, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_empty())
            .map(|entry| (entry.key, entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte-comparing lookup used only by the string interner; the one place
    /// string contents are compared instead of pointers.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<GcRef<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_empty() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else if entry.key.is_string() {
                let string = entry.key.as_string();
                if string.hash == hash && string.chars == chars {
                    return Some(string);
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes entries whose key is an unmarked, unlocked object. Run on the
    /// intern table after tracing, before sweep, so dead strings do not
    /// linger. Locked keys stay interned because sweep keeps their objects.
    pub fn remove_white(&mut self) {
        for index in 0..self.entries.len() {
            let entry = self.entries[index];
            if !entry.key.is_empty()
                && entry.key.is_obj()
                && !entry.key.as_obj().marked
                && !entry.key.as_obj().locked
            {
                self.entries[index].key = Value::empty();
                self.entries[index].value = Value::boolean(true);
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_overwrite() {
        let mut table = Table::new();
        assert!(table.set(Value::number(1.0), Value::number(10.0)));
        assert!(!table.set(Value::number(1.0), Value::number(20.0)));
        assert_eq!(table.get(Value::number(1.0)).unwrap().as_number(), 20.0);
        assert!(table.get(Value::number(2.0)).is_none());
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        for i in 0..32 {
            table.set(Value::number(i as f64), Value::number(i as f64));
        }
        assert!(table.delete(Value::number(7.0)));
        assert!(!table.delete(Value::number(7.0)));
        for i in 0..32 {
            let hit = table.get(Value::number(i as f64));
            if i == 7 {
                assert!(hit.is_none());
            } else {
                assert_eq!(hit.unwrap().as_number(), i as f64);
            }
        }
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let mut table = Table::new();
        table.set(Value::number(1.0), Value::nil());
        let capacity = table.capacity();
        table.delete(Value::number(1.0));
        table.set(Value::number(1.0), Value::boolean(true));
        assert_eq!(table.capacity(), capacity);
        assert!(table.get(Value::number(1.0)).unwrap().as_bool());
    }

    #[test]
    fn test_mixed_key_kinds() {
        let mut table = Table::new();
        table.set(Value::nil(), Value::number(1.0));
        table.set(Value::boolean(true), Value::number(2.0));
        table.set(Value::boolean(false), Value::number(3.0));
        table.set(Value::number(-0.0), Value::number(4.0));
        assert_eq!(table.get(Value::nil()).unwrap().as_number(), 1.0);
        assert_eq!(table.get(Value::boolean(true)).unwrap().as_number(), 2.0);
        assert_eq!(table.get(Value::boolean(false)).unwrap().as_number(), 3.0);
        // 0.0 and -0.0 compare equal, so they must collide.
        assert_eq!(table.get(Value::number(0.0)).unwrap().as_number(), 4.0);
    }

    #[test]
    fn test_add_all_overwrites() {
        let mut from = Table::new();
        let mut to = Table::new();
        to.set(Value::number(1.0), Value::number(1.0));
        from.set(Value::number(1.0), Value::number(9.0));
        from.set(Value::number(2.0), Value::number(2.0));
        from.add_all_to(&mut to);
        assert_eq!(to.get(Value::number(1.0)).unwrap().as_number(), 9.0);
        assert_eq!(to.get(Value::number(2.0)).unwrap().as_number(), 2.0);
        assert_eq!(to.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..1000 {
            table.set(Value::number(i as f64), Value::number((i * 2) as f64));
        }
        assert_eq!(table.len(), 1000);
        for i in 0..1000 {
            assert_eq!(
                table.get(Value::number(i as f64)).unwrap().as_number(),
                (i * 2) as f64
            );
        }
        // Power-of-two capacity is what the probe mask relies on.
        assert!(table.capacity().is_power_of_two());
    }
}
