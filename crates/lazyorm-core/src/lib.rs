//! Core types and traits for LazyORM.
//!
//! This crate provides the foundations shared by every persistence context:
//!
//! - `Value`, `Row` and `EntityRow` for loaded data
//! - `EntityIdentity` naming one row
//! - `MetadataRegistry` with lazy groups and association kinds
//! - `InitializationState` tracking which groups of an instance are loaded
//! - `Loader` trait for the storage seam

pub mod error;
pub mod identity;
pub mod loader;
pub mod metadata;
pub mod row;
pub mod state;
pub mod value;

pub use error::{
    ConfigError, ContextClosedError, EntityNotFoundError, Error, IdentityMutationError,
    QueryError, QueryErrorKind, Result, TypeError,
};
pub use identity::EntityIdentity;
pub use loader::Loader;
pub use metadata::{
    AssociationKind, AttributeInfo, BASE_GROUP, EntityModel, EntityModelBuilder, LazyGroup,
    MAX_GROUPS, MetadataRegistry, MetadataRegistryBuilder, NotFoundPolicy,
};
pub use row::{EntityRow, Row};
pub use state::{InitializationState, OverallState};
pub use value::Value;
