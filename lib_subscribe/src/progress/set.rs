//! # Progress Set
//!
//! The per-subscription high-water-marks: one `(uid, key)` record per source
//! table, where `key` is the highest timestamp already delivered for that
//! table. Records are kept sorted strictly ascending by `uid` so lookups are
//! a binary search.

use serde::{Deserialize, Serialize};

/// Key meaning "deliver from the beginning".
pub const KEY_FROM_BEGINNING: i64 = i64::MIN;

/// Initial capacity of a freshly created progress set.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 32;

/// # Progress Entry
///
/// High-water-mark for a single physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Server-assigned table uid.
    pub uid: i64,
    /// Highest delivered timestamp for the table.
    pub key: i64,
}

impl ProgressEntry {
    /// Creates a new entry.
    pub fn new(uid: i64, key: i64) -> Self {
        Self { uid, key }
    }
}

/// # Progress Set
///
/// Ordered collection of [`ProgressEntry`], unique and sorted by `uid`.
///
/// Deserialised input goes through [`ProgressSet::from_unsorted`], so any
/// sequence of entries yields a sorted, unique set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ProgressEntry>", into = "Vec<ProgressEntry>")]
pub struct ProgressSet {
    entries: Vec<ProgressEntry>,
}

impl ProgressSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PROGRESS_CAPACITY)
    }

    /// Creates an empty set able to hold `capacity` entries without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Builds a set from entries in any order.
    ///
    /// When a uid occurs more than once, the last occurrence wins.
    pub fn from_unsorted(mut entries: Vec<ProgressEntry>) -> Self {
        // Stable sort keeps input order among equal uids, so the last one is
        // the one to keep.
        entries.sort_by_key(|e| e.uid);
        let mut deduped: Vec<ProgressEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last_mut() {
                Some(last) if last.uid == entry.uid => *last = entry,
                _ => deduped.push(entry),
            }
        }
        Self { entries: deduped }
    }

    fn position(&self, uid: i64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&uid, |e| e.uid)
    }

    /// Key recorded for `uid`, if any.
    pub fn get(&self, uid: i64) -> Option<i64> {
        self.position(uid).ok().map(|idx| self.entries[idx].key)
    }

    /// Key recorded for `uid`, or `default` when the table is not tracked.
    pub fn get_or(&self, uid: i64, default: i64) -> i64 {
        self.get(uid).unwrap_or(default)
    }

    /// Whether `uid` is tracked.
    pub fn contains(&self, uid: i64) -> bool {
        self.position(uid).is_ok()
    }

    /// Overwrites the key of an existing entry. Unknown uids are ignored.
    ///
    /// Returns whether an entry was updated.
    pub fn update(&mut self, uid: i64, key: i64) -> bool {
        match self.position(uid) {
            Ok(idx) => {
                self.entries[idx].key = key;
                true
            }
            Err(_) => false,
        }
    }

    /// Moves the key of an existing entry forward, never backward.
    ///
    /// Returns whether the key changed.
    pub fn advance(&mut self, uid: i64, key: i64) -> bool {
        match self.position(uid) {
            Ok(idx) if self.entries[idx].key < key => {
                self.entries[idx].key = key;
                true
            }
            _ => false,
        }
    }

    /// Overwrites the key for `uid`, inserting the entry in order when absent.
    pub fn upsert(&mut self, uid: i64, key: i64) {
        match self.position(uid) {
            Ok(idx) => self.entries[idx].key = key,
            Err(idx) => self.entries.insert(idx, ProgressEntry::new(uid, key)),
        }
    }

    /// Swaps the whole content for `other`.
    pub fn replace_all(&mut self, other: ProgressSet) {
        self.entries = other.entries;
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked tables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no table is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending uid order.
    pub fn iter(&self) -> std::slice::Iter<'_, ProgressEntry> {
        self.entries.iter()
    }

    /// Entries in ascending uid order.
    pub fn as_slice(&self) -> &[ProgressEntry] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a ProgressSet {
    type Item = &'a ProgressEntry;
    type IntoIter = std::slice::Iter<'a, ProgressEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl From<Vec<ProgressEntry>> for ProgressSet {
    fn from(entries: Vec<ProgressEntry>) -> Self {
        Self::from_unsorted(entries)
    }
}

impl From<ProgressSet> for Vec<ProgressEntry> {
    fn from(set: ProgressSet) -> Self {
        set.entries
    }
}

impl FromIterator<ProgressEntry> for ProgressSet {
    fn from_iter<T: IntoIterator<Item = ProgressEntry>>(iter: T) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_strictly_sorted(set: &ProgressSet) -> bool {
        set.as_slice().windows(2).all(|w| w[0].uid < w[1].uid)
    }

    #[test]
    fn get_falls_back_to_default() {
        let set = ProgressSet::from_unsorted(vec![ProgressEntry::new(7, 100)]);
        assert_eq!(set.get_or(7, KEY_FROM_BEGINNING), 100);
        assert_eq!(set.get_or(8, KEY_FROM_BEGINNING), KEY_FROM_BEGINNING);
        assert_eq!(set.get(8), None);
    }

    #[test]
    fn upsert_keeps_order_and_uniqueness() {
        let mut set = ProgressSet::new();
        for uid in [30, 10, 20, 10, 40, 30] {
            set.upsert(uid, uid * 2);
        }
        assert!(is_strictly_sorted(&set));
        assert_eq!(set.len(), 4);
        assert_eq!(set.get(10), Some(20));
    }

    #[test]
    fn update_never_inserts() {
        let mut set = ProgressSet::from_unsorted(vec![ProgressEntry::new(1, 5)]);
        assert!(set.update(1, 9));
        assert!(!set.update(2, 9));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(1), Some(9));
    }

    #[test]
    fn advance_is_monotonic() {
        let mut set = ProgressSet::from_unsorted(vec![ProgressEntry::new(1, KEY_FROM_BEGINNING)]);
        assert!(set.advance(1, 50));
        assert!(!set.advance(1, 40));
        assert!(!set.advance(1, 50));
        assert_eq!(set.get(1), Some(50));
    }

    #[test]
    fn deserialized_sets_are_sorted_and_unique() {
        let set: ProgressSet = serde_json::from_str(
            r#"[{"uid":3,"key":30},{"uid":1,"key":10},{"uid":3,"key":31}]"#,
        )
        .unwrap();
        assert!(is_strictly_sorted(&set));
        assert_eq!(
            set.as_slice(),
            &[ProgressEntry::new(1, 10), ProgressEntry::new(3, 31)]
        );

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"[{"uid":1,"key":10},{"uid":3,"key":31}]"#);
    }

    #[test]
    fn from_unsorted_sorts_and_keeps_last_duplicate() {
        let set = ProgressSet::from_unsorted(vec![
            ProgressEntry::new(3, 1),
            ProgressEntry::new(1, 1),
            ProgressEntry::new(3, 2),
            ProgressEntry::new(2, 1),
        ]);
        assert!(is_strictly_sorted(&set));
        assert_eq!(set.get(3), Some(2));
    }

    #[test]
    fn replace_all_and_clear() {
        let mut set = ProgressSet::from_unsorted(vec![ProgressEntry::new(1, 1)]);
        set.replace_all([ProgressEntry::new(5, 0), ProgressEntry::new(4, 0)].into_iter().collect());
        assert_eq!(set.iter().map(|e| e.uid).collect::<Vec<_>>(), vec![4, 5]);
        set.clear();
        assert!(set.is_empty());
    }
}
