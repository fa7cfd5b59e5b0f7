//! Append-only extent sequence with the sort orders the analysis relies on.

use crate::Extent;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Append-only sequence of extents.
///
/// Unlike [`ExtentMap`](crate::ExtentMap), a list may hold overlapping or
/// duplicate entries mid-algorithm (the analyzer concatenates two lists
/// before sorting). Sorts are unstable; nothing relies on stability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    entries: Vec<Extent>,
}

impl ExtentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, extent: Extent) {
        self.entries.push(extent);
    }

    /// Concatenate `other` onto `self`, without deduplication.
    pub fn append_all(&mut self, other: &Self) {
        self.entries.extend_from_slice(&other.entries);
    }

    pub fn pop_back(&mut self) -> Option<Extent> {
        self.entries.pop()
    }

    #[must_use]
    pub fn back(&self) -> Option<&Extent> {
        self.entries.last()
    }

    pub fn back_mut(&mut self) -> Option<&mut Extent> {
        self.entries.last_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ascending `(physical, length)`.
    pub fn sort_by_physical(&mut self) {
        self.entries
            .sort_unstable_by_key(|e| (e.physical, e.length));
    }

    /// Ascending `(logical, length)`.
    pub fn sort_by_logical(&mut self) {
        self.entries.sort_unstable_by_key(|e| (e.logical, e.length));
    }

    /// Descending length.
    pub fn sort_by_reverse_length(&mut self) {
        self.entries
            .sort_unstable_by_key(|e| std::cmp::Reverse(e.length));
    }

    /// Sum of all entry lengths.
    #[must_use]
    pub fn length_sum(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }
}

impl Deref for ExtentList {
    type Target = [Extent];

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

impl DerefMut for ExtentList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entries
    }
}

impl FromIterator<Extent> for ExtentList {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
