//! Per-instance initialization bookkeeping.
//!
//! One bit per lazy group, plus a terminal `missing` flag. Once a group is
//! marked initialized it stays initialized; once an instance is found
//! missing nothing else changes.

use crate::metadata::{EntityModel, LazyGroup, MAX_GROUPS};

/// Coarse lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverallState {
    /// Only the identity is known.
    Uninitialized,
    /// Some groups (normally base) are loaded, others are not.
    PartiallyInitialized,
    /// Every group is loaded.
    Initialized,
    /// The backing row was found absent.
    Missing,
}

/// Which lazy groups of an instance are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationState {
    group_count: usize,
    loaded: u64,
    missing: bool,
}

impl InitializationState {
    /// Fresh state for a placeholder of `model`: nothing loaded.
    pub fn new(model: &EntityModel) -> Self {
        Self::with_group_count(model.groups().len())
    }

    /// State with every group of `model` loaded.
    pub fn fully_initialized(model: &EntityModel) -> Self {
        let mut state = Self::new(model);
        state.loaded = state.all_mask();
        state
    }

    fn with_group_count(group_count: usize) -> Self {
        debug_assert!(group_count >= 1 && group_count <= MAX_GROUPS);
        Self {
            group_count,
            loaded: 0,
            missing: false,
        }
    }

    fn all_mask(&self) -> u64 {
        if self.group_count >= 64 {
            u64::MAX
        } else {
            (1u64 << self.group_count) - 1
        }
    }

    /// Number of groups tracked.
    pub fn group_count(&self) -> usize {
        self.group_count
    }

    /// Is `group` loaded? Always false once the instance is missing.
    pub fn is_group_initialized(&self, group: &LazyGroup) -> bool {
        self.is_index_initialized(group.index())
    }

    /// Is the group at `index` loaded?
    pub fn is_index_initialized(&self, index: usize) -> bool {
        !self.missing && index < self.group_count && self.loaded & (1 << index) != 0
    }

    /// Is the base group loaded?
    pub fn is_base_initialized(&self) -> bool {
        self.is_index_initialized(0)
    }

    /// Coarse state.
    pub fn overall(&self) -> OverallState {
        if self.missing {
            OverallState::Missing
        } else if self.loaded == 0 {
            OverallState::Uninitialized
        } else if self.loaded == self.all_mask() {
            OverallState::Initialized
        } else {
            OverallState::PartiallyInitialized
        }
    }

    /// Was the backing row found absent?
    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Mark `group` loaded. A no-op when already loaded or when missing.
    ///
    /// # Panics
    ///
    /// Panics if the group index is out of range for this entity type; that
    /// means a group from a different entity's metadata was passed in.
    pub fn mark_group_initialized(&mut self, group: &LazyGroup) {
        self.mark_index_initialized(group.index());
    }

    /// Index-based form of [`mark_group_initialized`](Self::mark_group_initialized).
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn mark_index_initialized(&mut self, index: usize) {
        assert!(
            index < self.group_count,
            "lazy group index {index} out of range ({} groups)",
            self.group_count
        );
        if !self.missing {
            self.loaded |= 1 << index;
        }
    }

    /// Mark the instance missing. Idempotent and terminal.
    pub fn mark_missing(&mut self) {
        self.missing = true;
    }

    /// Indices of groups still to load (empty once missing).
    pub fn pending_groups(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.group_count).filter(move |&i| !self.missing && self.loaded & (1 << i) == 0)
    }

    /// Indices of loaded groups.
    pub fn loaded_groups(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.group_count).filter(move |&i| self.is_index_initialized(i))
    }

    /// Do all groups in `indices` need nothing more?
    pub fn covers(&self, indices: &[usize]) -> bool {
        indices.iter().all(|&i| self.is_index_initialized(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttributeInfo, MetadataRegistry};
    use std::sync::Arc;

    fn model() -> Arc<EntityModel> {
        let registry = MetadataRegistry::builder()
            .entity(
                EntityModel::builder("Human")
                    .attribute(AttributeInfo::basic("sex"))
                    .attribute(AttributeInfo::basic("age").lazy_group("age"))
                    .attribute(AttributeInfo::basic("photo").lazy_group("photo")),
            )
            .build()
            .unwrap();
        Arc::clone(registry.model("Human").unwrap())
    }

    #[test]
    fn test_transitions() {
        let model = model();
        let mut state = InitializationState::new(&model);
        assert_eq!(state.overall(), OverallState::Uninitialized);
        assert_eq!(state.pending_groups().count(), 3);

        state.mark_group_initialized(model.base_group());
        assert_eq!(state.overall(), OverallState::PartiallyInitialized);
        assert!(state.is_base_initialized());

        // Marking twice is harmless.
        state.mark_group_initialized(model.base_group());
        state.mark_group_initialized(model.group("age").unwrap());
        state.mark_group_initialized(model.group("photo").unwrap());
        assert_eq!(state.overall(), OverallState::Initialized);
        assert_eq!(state.pending_groups().count(), 0);
    }

    #[test]
    fn test_missing_is_terminal() {
        let model = model();
        let mut state = InitializationState::new(&model);
        state.mark_group_initialized(model.base_group());
        state.mark_missing();
        state.mark_missing();
        assert_eq!(state.overall(), OverallState::Missing);
        assert!(!state.is_base_initialized());

        state.mark_group_initialized(model.group("age").unwrap());
        assert_eq!(state.overall(), OverallState::Missing);
        assert_eq!(state.loaded_groups().count(), 0);
    }

    #[test]
    fn test_fully_initialized() {
        let model = model();
        let state = InitializationState::fully_initialized(&model);
        assert_eq!(state.overall(), OverallState::Initialized);
        assert!(state.covers(&[0, 1, 2]));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_group_panics() {
        let model = model();
        let mut state = InitializationState::new(&model);
        state.mark_index_initialized(7);
    }
}
