//! The data-access seam used by the persistence context.

use crate::Result;
use crate::identity::EntityIdentity;
use crate::metadata::LazyGroup;
use crate::row::EntityRow;
use std::collections::HashMap;

/// Fetches entity state from storage.
///
/// Every call counts as one prepared statement in session statistics.
/// Errors are propagated to the caller unchanged, and instance state is left
/// as it was before the call.
///
/// # Row contract
///
/// Returned rows carry the concrete entity type in their identity (which may
/// be a subtype of the requested one). Columns are named after the attributes
/// of the requested groups; owned to-one columns hold the target identifier
/// (or NULL). Associations that are resolved by join, meaning ignore-policy
/// to-ones and inverse to-ones in a requested group, are placed in
/// [`EntityRow::joined`], where `None` means the target row does not exist.
pub trait Loader: Send {
    /// Load the given groups of one entity.
    ///
    /// Returns `Ok(None)` when no row exists for `identity`.
    fn load_groups(
        &mut self,
        identity: &EntityIdentity,
        groups: &[&LazyGroup],
    ) -> Result<Option<EntityRow>>;

    /// Load one group for several entities of the same root type in a single
    /// statement. Identities with no row are simply absent from the result,
    /// which is keyed by the requested identity.
    fn load_batch(
        &mut self,
        entity: &'static str,
        identities: &[EntityIdentity],
        group: &LazyGroup,
    ) -> Result<HashMap<EntityIdentity, EntityRow>>;

    /// Load the elements of a collection. Element rows carry their base
    /// group columns.
    fn load_collection(
        &mut self,
        owner: &EntityIdentity,
        attribute: &'static str,
    ) -> Result<Vec<EntityRow>>;
}
