use std::collections::VecDeque;

/// How many of the most recent purchase ids a cookie remembers.
pub const NUM_SAVED_PURCHASE_IDS: usize = 5;

/// Ring of the most recent purchase ids, oldest first.
///
/// Never holds duplicates: re-inserting an id moves it to the most recent
/// position. Inserting a new id at capacity evicts the oldest one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurchaseIds {
    ids: VecDeque<String>,
}

impl PurchaseIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `purchase_id` as the most recent entry.
    ///
    /// Returns `false` if the id was already present (it is moved to the end
    /// instead of being duplicated), `true` if it was newly added.
    pub fn insert(&mut self, purchase_id: &str) -> bool {
        if let Some(pos) = self.ids.iter().position(|id| id == purchase_id) {
            if let Some(existing) = self.ids.remove(pos) {
                self.ids.push_back(existing);
            }
            return false;
        }

        if self.ids.len() == NUM_SAVED_PURCHASE_IDS {
            self.ids.pop_front();
        }
        self.ids.push_back(purchase_id.to_string());
        true
    }

    /// True if `purchase_id` is already the most recent entry.
    pub fn is_latest(&self, purchase_id: &str) -> bool {
        self.ids.back().is_some_and(|id| id == purchase_id)
    }

    pub fn contains(&self, purchase_id: &str) -> bool {
        self.ids.iter().any(|id| id == purchase_id)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}
