//! Ordinal-keyed holding area for out-of-order synthesis results

use std::collections::BTreeMap;

/// Releases completed items strictly in ordinal order
///
/// A slot completed with `None` (a failed fragment) is skipped without
/// blocking the ones after it.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u32,
    held: BTreeMap<u32, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 0,
            held: BTreeMap::new(),
        }
    }

    /// Record the result for `ordinal`; returns everything now releasable
    pub fn complete(&mut self, ordinal: u32, item: Option<T>) -> Vec<(u32, T)> {
        if ordinal < self.next {
            tracing::warn!(ordinal, next = self.next, "duplicate completion ignored");
            return Vec::new();
        }
        self.held.insert(ordinal, item);

        let mut released = Vec::new();
        while let Some(slot) = self.held.remove(&self.next) {
            if let Some(item) = slot {
                released.push((self.next, item));
            }
            self.next += 1;
        }
        released
    }

    /// Lowest ordinal not yet released or skipped
    #[must_use]
    pub const fn next_ordinal(&self) -> u32 {
        self.next
    }

    /// Completed items waiting on an earlier ordinal
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }
}
