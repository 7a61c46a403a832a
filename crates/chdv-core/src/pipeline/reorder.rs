use std::collections::BTreeMap;

/// Collects out-of-order block completions and releases them in strict
/// index order.
#[derive(Debug)]
pub struct ReadySet<T> {
    next_index: u32,
    pending: BTreeMap<u32, T>,
}

impl<T> ReadySet<T> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Inserts a completed block and drains the run of consecutive blocks
    /// now ready, starting at the release cursor.
    pub fn insert(&mut self, index: u32, value: T) -> Vec<T> {
        self.pending.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.pending.remove(&self.next_index) {
            ready.push(value);
            self.next_index += 1;
        }
        ready
    }

    /// Index of the next block to be released.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Number of blocks parked waiting for an earlier one.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for ReadySet<T> {
    fn default() -> Self {
        Self::new()
    }
}
