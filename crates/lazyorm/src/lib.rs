//! LazyORM - lazy attribute loading for entity graphs.
//!
//! LazyORM is the loading half of an ORM persistence context:
//!
//! - Lazy attribute groups, loaded on first access
//! - Interception of attribute reads and writes on enhanced instances
//! - Proxy stand-ins for polymorphic references, swapped for the loaded subtype
//! - Batch fetching of sibling placeholders
//! - Merge of detached state into a session without deep copies
//!
//! Storage stays outside: a session issues every statement through a
//! [`Loader`] you provide.
//!
//! # Quick Start
//!
//! ```ignore
//! use lazyorm::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityModel::builder("Human")
//!             .identifier("name")
//!             .attribute(AttributeInfo::basic("sex"))
//!             .attribute(AttributeInfo::basic("photo").lazy_group("photo")),
//!     )
//!     .build()?;
//!
//! let session = Session::new(registry, my_loader);
//!
//! // Nothing is loaded yet
//! let human = session.get_reference("Human", "A")?;
//!
//! // Loads the base group only
//! let sex = human.get("sex")?;
//!
//! // Loads the "photo" group in its own statement
//! let photo = human.get("photo")?;
//! ```

// Re-export all public types from sub-crates
pub use lazyorm_core::{
    AssociationKind, AttributeInfo, BASE_GROUP, ConfigError, ContextClosedError, EntityIdentity,
    EntityModel, EntityModelBuilder, EntityNotFoundError, EntityRow, Error,
    IdentityMutationError, InitializationState, LazyGroup, Loader, MAX_GROUPS, MetadataRegistry,
    MetadataRegistryBuilder, NotFoundPolicy, OverallState, QueryError, QueryErrorKind, Result,
    Row, TypeError, Value,
};
pub use lazyorm_session::{
    AttributeValue, EntityKey, EntityRef, FetchStats, FetchTracker, IdentityMap, Instance,
    LazilyInterceptable, PersistentCollection, Proxy, Session, SessionConfig, SessionStatistics,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Mapping
        AttributeInfo,
        EntityModel,
        MetadataRegistry,
        NotFoundPolicy,
        // Loaded data
        EntityIdentity,
        EntityRow,
        Error,
        Loader,
        Result,
        Row,
        Value,
        // Session
        EntityRef,
        LazilyInterceptable,
        PersistentCollection,
        Session,
        SessionConfig,
    };
}
