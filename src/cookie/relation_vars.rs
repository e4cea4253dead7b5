//! Relation variables (eVars).
//!
//! [`RelationVars`] is the table of relation variable slots inside a single
//! cookie. Each slot is tagged with a [`RelationId`] and addressed by a stable
//! [`VarHandle`]; it holds an ordered run of [`RelVar`] elements whose length is
//! governed by the [`AllocationPolicy`] used to write it.
//!
//! Storage is an arena of slots (indexed by handle, never reordered or reused)
//! plus a separate index of handles kept sorted by relation id. Lookups binary
//! search the index; inserting a new relation id shifts the index, which is
//! fine because a record only ever carries a few dozen relation ids.
//!
//! A cleared slot keeps its handle and relation id so it can still be reported
//! as modified, but it no longer counts as *set*.

use std::collections::VecDeque;

/// Identifier of a relation variable.
pub type RelationId = u16;

/// Reserved relation id. Terminates the relation variable section on the wire,
/// so it can never be stored.
pub const INVALID_RELATION_ID: RelationId = u16::MAX;

/// How a write to a relation variable is arbitrated against what is already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationPolicy {
    /// Keep the first value until the slot is cleared. A slot holding several
    /// values (from linear writes) is replaced by the new one.
    First,
    /// Every write replaces the value.
    Last,
    /// Append, keeping at most this many of the most recent values (`0` = unbounded).
    Linear(usize),
}

/// A single timestamped, revisioned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelVar {
    pub value: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub revision: u8,
}

/// Stable reference to a slot, valid until the table it came from is [reset](RelationVars::reset).
///
/// Handles from before a reset are rejected rather than resolved to whatever
/// slot now sits at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarHandle {
    slot: u32,
    generation: u32,
}

impl VarHandle {
    fn index(self) -> usize {
        self.slot as usize
    }
}

#[derive(Debug, Clone)]
struct Slot {
    relation_id: RelationId,
    modified: bool,
    elements: VecDeque<RelVar>,
}

#[derive(Debug, Clone, Default)]
pub struct RelationVars {
    /// Slots in allocation order. Index == handle.
    slots: Vec<Slot>,
    /// Handles sorted by their slot's relation id.
    sorted: Vec<VarHandle>,
    /// Bumped by `reset`; stamped into every handle issued.
    generation: u32,
}

impl RelationVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncates the slot for `relation_id` to zero elements and marks it modified.
    ///
    /// Returns `false` (and does nothing) if the id was never written.
    pub fn clear(&mut self, relation_id: RelationId) -> bool {
        match self.find(relation_id) {
            Some(handle) => {
                let slot = &mut self.slots[handle.index()];
                slot.elements.clear();
                slot.modified = true;
                true
            }
            None => false,
        }
    }

    /// Writes `value` to `relation_id` under `policy`.
    ///
    /// An empty `value` is not a write; under [`AllocationPolicy::Last`] it clears
    /// the slot instead. Returns the slot's handle for linear writes so callers
    /// can follow up with [`add_linear_element`](Self::add_linear_element),
    /// `None` otherwise.
    pub fn set_var(
        &mut self,
        relation_id: RelationId,
        value: &str,
        timestamp: i64,
        revision: u8,
        policy: AllocationPolicy,
    ) -> Option<VarHandle> {
        self.write(relation_id, value, timestamp, revision, policy).0
    }

    /// Same as [`set_var`](Self::set_var), additionally reporting whether the
    /// table changed.
    pub(crate) fn write(
        &mut self,
        relation_id: RelationId,
        value: &str,
        timestamp: i64,
        revision: u8,
        policy: AllocationPolicy,
    ) -> (Option<VarHandle>, bool) {
        if relation_id == INVALID_RELATION_ID {
            log::warn!("Ignoring write to reserved relation id {relation_id:#06x}");
            return (None, false);
        }

        if value.is_empty() {
            let cleared = policy == AllocationPolicy::Last && self.clear(relation_id);
            return (None, cleared);
        }

        let handle = match self.position(relation_id) {
            Ok(pos) => {
                let handle = self.sorted[pos];
                // FIRST keeps a single value; a longer run left by LINEAR writes collapses.
                if policy == AllocationPolicy::First
                    && self.slots[handle.index()].elements.len() == 1
                {
                    return (None, false);
                }
                handle
            }
            Err(pos) => {
                let handle = VarHandle {
                    slot: self.slots.len() as u32,
                    generation: self.generation,
                };
                self.slots.push(Slot {
                    relation_id,
                    modified: false,
                    elements: VecDeque::new(),
                });
                self.sorted.insert(pos, handle);
                handle
            }
        };

        let slot = &mut self.slots[handle.index()];
        match policy {
            AllocationPolicy::First | AllocationPolicy::Last => slot.elements.clear(),
            AllocationPolicy::Linear(max) if max > 0 => {
                while slot.elements.len() >= max {
                    slot.elements.pop_front();
                }
            }
            AllocationPolicy::Linear(_) => {}
        }
        slot.elements.push_back(RelVar {
            value: value.to_string(),
            timestamp,
            revision,
        });
        slot.modified = true;

        match policy {
            AllocationPolicy::Linear(_) => (Some(handle), true),
            _ => (None, true),
        }
    }

    /// Appends to the slot behind `handle` without any policy check or eviction.
    ///
    /// Meant for restoring elements whose order and count are already known to
    /// be right (e.g. when decoding). Returns `false` for a handle this table
    /// never issued, or issued before the last [`reset`](Self::reset).
    pub fn add_linear_element(
        &mut self,
        handle: VarHandle,
        value: &str,
        timestamp: i64,
        revision: u8,
    ) -> bool {
        if handle.generation != self.generation {
            return false;
        }
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return false;
        };
        slot.elements.push_back(RelVar {
            value: value.to_string(),
            timestamp,
            revision,
        });
        slot.modified = true;
        true
    }

    /// Number of elements held for `relation_id` (0 if never set or cleared).
    pub fn element_count(&self, relation_id: RelationId) -> usize {
        self.find(relation_id)
            .map_or(0, |h| self.slots[h.index()].elements.len())
    }

    /// Handle of the slot for `relation_id`, or `None` if it holds no elements.
    pub fn handle(&self, relation_id: RelationId) -> Option<VarHandle> {
        self.find(relation_id)
            .filter(|h| !self.slots[h.index()].elements.is_empty())
    }

    pub fn element(&self, handle: VarHandle, index: usize) -> Option<&RelVar> {
        if handle.generation != self.generation {
            return None;
        }
        self.slots.get(handle.index())?.elements.get(index)
    }

    pub fn element_by_id(&self, relation_id: RelationId, index: usize) -> Option<&RelVar> {
        self.element(self.find(relation_id)?, index)
    }

    /// All elements of `relation_id`, oldest first.
    pub fn elements(&self, relation_id: RelationId) -> impl Iterator<Item = &RelVar> {
        self.find(relation_id)
            .into_iter()
            .flat_map(move |h| self.slots[h.index()].elements.iter())
    }

    /// Lowest relation id holding at least one element.
    pub fn first_set_id(&self) -> Option<RelationId> {
        self.scan_from(0, |slot| !slot.elements.is_empty())
    }

    /// Next relation id above `after` holding at least one element.
    pub fn next_set_id(&self, after: RelationId) -> Option<RelationId> {
        self.scan_from(self.position_after(after), |slot| !slot.elements.is_empty())
    }

    /// Lowest relation id touched since the last flush (cleared ones included).
    pub fn first_modified_id(&self) -> Option<RelationId> {
        self.scan_from(0, |slot| slot.modified)
    }

    pub fn next_modified_id(&self, after: RelationId) -> Option<RelationId> {
        self.scan_from(self.position_after(after), |slot| slot.modified)
    }

    /// Set relation ids in ascending order.
    pub fn set_ids(&self) -> impl Iterator<Item = RelationId> + '_ {
        self.ids_where(|slot| !slot.elements.is_empty())
    }

    /// Modified relation ids in ascending order.
    pub fn modified_ids(&self) -> impl Iterator<Item = RelationId> + '_ {
        self.ids_where(|slot| slot.modified)
    }

    /// Forgets which slots were touched. Called once the owning cookie is saved.
    pub fn mark_flushed(&mut self) {
        for slot in &mut self.slots {
            slot.modified = false;
        }
    }

    /// Drops every slot. Handles issued before this call become invalid.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.sorted.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Number of registered slots, cleared ones included.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// True when no slot holds an element.
    pub fn is_empty(&self) -> bool {
        self.first_set_id().is_none()
    }

    fn find(&self, relation_id: RelationId) -> Option<VarHandle> {
        self.position(relation_id).ok().map(|pos| self.sorted[pos])
    }

    fn position(&self, relation_id: RelationId) -> Result<usize, usize> {
        self.sorted
            .binary_search_by_key(&relation_id, |h| self.slots[h.index()].relation_id)
    }

    fn position_after(&self, relation_id: RelationId) -> usize {
        match self.position(relation_id) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        }
    }

    fn scan_from(&self, pos: usize, pred: impl Fn(&Slot) -> bool) -> Option<RelationId> {
        self.sorted
            .get(pos..)?
            .iter()
            .map(|h| &self.slots[h.index()])
            .find(|slot| pred(slot))
            .map(|slot| slot.relation_id)
    }

    fn ids_where(&self, pred: fn(&Slot) -> bool) -> impl Iterator<Item = RelationId> + '_ {
        self.sorted
            .iter()
            .map(|h| &self.slots[h.index()])
            .filter(move |slot| pred(slot))
            .map(|slot| slot.relation_id)
    }
}

/// Two tables are equal when they hold the same set relation ids with identical
/// element runs. Policies, cleared slots and modified marks are not compared.
impl PartialEq for RelationVars {
    fn eq(&self, other: &Self) -> bool {
        let mut ours = self.set_ids();
        let mut theirs = other.set_ids();
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a == b => {
                    if !self.elements(a).eq(other.elements(b)) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }
}

impl Eq for RelationVars {}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(vars: &RelationVars, id: RelationId) -> Vec<&str> {
        vars.elements(id).map(|rv| rv.value.as_str()).collect()
    }

    #[test]
    fn first_keeps_initial_value_until_cleared() {
        let mut vars = RelationVars::new();
        vars.set_var(4, "a", 10, 1, AllocationPolicy::First);
        vars.set_var(4, "b", 11, 2, AllocationPolicy::First);
        assert_eq!(values(&vars, 4), vec!["a"]);

        assert!(vars.clear(4));
        vars.set_var(4, "b", 12, 3, AllocationPolicy::First);
        assert_eq!(values(&vars, 4), vec!["b"]);
        assert_eq!(vars.element_by_id(4, 0).unwrap().timestamp, 12);
    }

    #[test]
    fn last_overwrites_and_empty_clears() {
        let mut vars = RelationVars::new();
        vars.set_var(2, "x", 1, 0, AllocationPolicy::Last);
        vars.set_var(2, "y", 2, 0, AllocationPolicy::Last);
        assert_eq!(values(&vars, 2), vec!["y"]);
        assert!(vars.element_by_id(2, 1).is_none());

        vars.set_var(2, "", 3, 0, AllocationPolicy::Last);
        assert_eq!(vars.element_count(2), 0);
        assert_eq!(vars.slot_count(), 1);
    }

    #[test]
    fn empty_value_is_not_a_write_for_first_and_linear() {
        let mut vars = RelationVars::new();
        assert_eq!(vars.set_var(1, "", 0, 0, AllocationPolicy::Linear(3)), None);
        assert_eq!(vars.set_var(1, "", 0, 0, AllocationPolicy::First), None);
        assert_eq!(vars.slot_count(), 0);
    }

    #[test]
    fn linear_keeps_most_recent_in_order() {
        let mut vars = RelationVars::new();
        for (i, v) in ["v1", "v2", "v3", "v4", "v5"].iter().enumerate() {
            vars.set_var(7, v, i as i64, i as u8, AllocationPolicy::Linear(3));
        }
        assert_eq!(values(&vars, 7), vec!["v3", "v4", "v5"]);
    }

    #[test]
    fn linear_zero_is_unbounded() {
        let mut vars = RelationVars::new();
        for i in 0..40 {
            vars.set_var(7, &format!("v{i}"), i, 0, AllocationPolicy::Linear(0));
        }
        assert_eq!(vars.element_count(7), 40);
    }

    #[test]
    fn mixed_policy_sequence() {
        let mut vars = RelationVars::new();
        let t = 1_000;
        vars.set_var(1, "Var1a", t, 0, AllocationPolicy::First);
        vars.set_var(1, "Var1a", t + 1, 1, AllocationPolicy::First);
        assert_eq!(vars.element_by_id(1, 0).unwrap().timestamp, t);

        vars.set_var(1, "Var1b", t + 2, 2, AllocationPolicy::Last);
        assert_eq!(values(&vars, 1), vec!["Var1b"]);

        vars.clear(1);
        assert_eq!(vars.element_count(1), 0);
        assert!(vars.element_by_id(1, 0).is_none());

        vars.set_var(1, "Var1c", t + 3, 3, AllocationPolicy::First);
        vars.set_var(1, "Var1d", t + 4, 4, AllocationPolicy::Linear(1));
        assert_eq!(values(&vars, 1), vec!["Var1d"]);
        vars.set_var(1, "Var1e", t + 5, 5, AllocationPolicy::Linear(2));
        vars.set_var(1, "Var1f", t + 6, 6, AllocationPolicy::Linear(3));
        assert_eq!(values(&vars, 1), vec!["Var1d", "Var1e", "Var1f"]);
        vars.set_var(1, "Var1g", t + 7, 7, AllocationPolicy::Linear(3));
        assert_eq!(values(&vars, 1), vec!["Var1e", "Var1f", "Var1g"]);

        // Shrinking the bound evicts down to it before appending.
        vars.set_var(1, "Var1h", t + 8, 8, AllocationPolicy::Linear(2));
        assert_eq!(values(&vars, 1), vec!["Var1g", "Var1h"]);
        let last = vars.element_by_id(1, 1).unwrap();
        assert_eq!((last.timestamp, last.revision), (t + 8, 8));

        // FIRST over a multi-value run collapses it to the new value, which then sticks.
        vars.set_var(1, "Var1i", t + 9, 9, AllocationPolicy::First);
        assert_eq!(values(&vars, 1), vec!["Var1i"]);
        vars.set_var(1, "Var1j", t + 10, 10, AllocationPolicy::First);
        assert_eq!(values(&vars, 1), vec!["Var1i"]);
    }

    #[test]
    fn add_linear_element_bypasses_eviction() {
        let mut vars = RelationVars::new();
        let handle = vars
            .set_var(9, "a", 0, 0, AllocationPolicy::Linear(1))
            .unwrap();
        assert!(vars.add_linear_element(handle, "b", 1, 0));
        assert!(vars.add_linear_element(handle, "c", 2, 0));
        assert_eq!(values(&vars, 9), vec!["a", "b", "c"]);
    }

    #[test]
    fn first_replaces_unbounded_linear_history() {
        let mut vars = RelationVars::new();
        for v in ["a", "b", "c"] {
            vars.set_var(1, v, 0, 0, AllocationPolicy::Linear(0));
        }
        assert!(vars.write(1, "f", 1, 1, AllocationPolicy::First).1);
        assert_eq!(values(&vars, 1), vec!["f"]);
        assert_eq!(vars.element_by_id(1, 0).unwrap().timestamp, 1);
    }

    #[test]
    fn handles_from_before_reset_are_rejected() {
        let mut vars = RelationVars::new();
        let stale = vars.set_var(4, "a", 0, 0, AllocationPolicy::Linear(0)).unwrap();

        vars.reset();
        let fresh = vars.set_var(9, "b", 0, 0, AllocationPolicy::Linear(0)).unwrap();
        assert_ne!(stale, fresh);

        assert!(vars.element(stale, 0).is_none());
        assert!(!vars.add_linear_element(stale, "c", 0, 0));
        assert_eq!(values(&vars, 9), vec!["b"]);
        assert_eq!(vars.element(fresh, 0).unwrap().value, "b");
    }

    #[test]
    fn add_linear_element_rejects_unknown_handle() {
        let mut other = RelationVars::new();
        other.set_var(1, "x", 0, 0, AllocationPolicy::Linear(0));
        other.set_var(2, "x", 0, 0, AllocationPolicy::Linear(0));
        let foreign = other.handle(2).unwrap();

        let mut vars = RelationVars::new();
        assert!(!vars.add_linear_element(foreign, "a", 0, 0));
    }

    #[test]
    fn handles_are_stable_across_inserts() {
        let mut vars = RelationVars::new();
        let h50 = vars.set_var(50, "a", 0, 0, AllocationPolicy::Linear(0)).unwrap();
        for id in [10, 90, 30, 70, 5] {
            vars.set_var(id, "z", 0, 0, AllocationPolicy::Last);
        }
        assert_eq!(vars.handle(50), Some(h50));
        assert_eq!(vars.element(h50, 0).unwrap().value, "a");

        vars.clear(50);
        assert_eq!(vars.handle(50), None);
        let again = vars.set_var(50, "b", 0, 0, AllocationPolicy::Linear(0));
        assert_eq!(again, Some(h50));
    }

    #[test]
    fn set_enumeration_is_ascending_and_skips_cleared() {
        let mut vars = RelationVars::new();
        for id in [1, 9, 5, 7, 3, 8, 4, 2, 6, 10, 13, 12, 11] {
            vars.set_var(id, &format!("Var{id}"), 0, 0, AllocationPolicy::First);
        }
        vars.clear(11);

        let ids: Vec<_> = vars.set_ids().collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 13]);

        let mut walked = Vec::new();
        let mut cur = vars.first_set_id();
        while let Some(id) = cur {
            walked.push(id);
            cur = vars.next_set_id(id);
        }
        assert_eq!(walked, ids);

        // Walking from an id that is not registered resumes at the next one.
        assert_eq!(vars.next_set_id(0), Some(1));
        assert_eq!(vars.next_set_id(11), Some(12));
        assert_eq!(vars.next_set_id(13), None);
    }

    #[test]
    fn modified_enumeration_includes_cleared_until_flushed() {
        let mut vars = RelationVars::new();
        vars.set_var(3, "a", 0, 0, AllocationPolicy::Last);
        vars.set_var(1, "b", 0, 0, AllocationPolicy::Last);
        vars.mark_flushed();
        assert_eq!(vars.first_modified_id(), None);

        vars.clear(3);
        vars.set_var(2, "c", 0, 0, AllocationPolicy::Last);
        let modified: Vec<_> = vars.modified_ids().collect();
        assert_eq!(modified, vec![2, 3]);
        assert_eq!(vars.first_modified_id(), Some(2));
        assert_eq!(vars.next_modified_id(2), Some(3));
        assert_eq!(vars.next_modified_id(3), None);

        let set: Vec<_> = vars.set_ids().collect();
        assert_eq!(set, vec![1, 2]);
    }

    #[test]
    fn ignored_first_write_reports_no_change() {
        let mut vars = RelationVars::new();
        assert!(vars.write(1, "a", 0, 0, AllocationPolicy::First).1);
        assert!(!vars.write(1, "b", 0, 0, AllocationPolicy::First).1);
        assert!(!vars.write(2, "", 0, 0, AllocationPolicy::Last).1);
    }

    #[test]
    fn reserved_id_is_never_stored() {
        let mut vars = RelationVars::new();
        vars.set_var(INVALID_RELATION_ID, "x", 0, 0, AllocationPolicy::Last);
        assert_eq!(vars.slot_count(), 0);
    }

    #[test]
    fn equality_ignores_policy_and_cleared_slots() {
        let mut a = RelationVars::new();
        a.set_var(1, "x", 5, 1, AllocationPolicy::First);
        a.set_var(2, "gone", 5, 1, AllocationPolicy::Last);
        a.clear(2);

        let mut b = RelationVars::new();
        b.set_var(1, "x", 5, 1, AllocationPolicy::Last);
        assert_eq!(a, b);

        b.set_var(3, "extra", 5, 1, AllocationPolicy::Last);
        assert_ne!(a, b);
    }

    #[test]
    fn equality_detects_divergence_after_first_entry() {
        let mut a = RelationVars::new();
        a.set_var(1, "x", 0, 0, AllocationPolicy::Last);
        a.set_var(2, "y", 0, 0, AllocationPolicy::Last);

        let mut b = RelationVars::new();
        b.set_var(1, "x", 0, 0, AllocationPolicy::Last);
        b.set_var(3, "y", 0, 0, AllocationPolicy::Last);

        assert_ne!(a, b);
        assert_ne!(b, a);
    }
}
