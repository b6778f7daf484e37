//! Error types for LazyORM operations.

use crate::identity::EntityIdentity;
use std::fmt;

/// The primary error type for all LazyORM operations.
#[derive(Debug)]
pub enum Error {
    /// The identified row does not exist (or was found missing earlier)
    EntityNotFound(EntityNotFoundError),
    /// Attempt to change the identifier of a managed instance
    IdentityMutation(IdentityMutationError),
    /// A load was required but the owning persistence context has ended
    ContextClosed(ContextClosedError),
    /// Loader/query execution errors, propagated unchanged
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Mapping metadata errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct EntityNotFoundError {
    pub identity: EntityIdentity,
}

#[derive(Debug, Clone)]
pub struct IdentityMutationError {
    pub identity: EntityIdentity,
    pub attempted: crate::Value,
}

#[derive(Debug, Clone)]
pub struct ContextClosedError {
    pub identity: EntityIdentity,
    /// The attribute whose access required a load, if any.
    pub attribute: Option<&'static str>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Connection lost or refused
    Connection,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Loader returned data that does not fit the mapping
    Protocol,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Loader output that contradicts the mapping (missing column, unknown type, ...).
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Protocol, message)
    }
}

impl Error {
    /// Build an `EntityNotFound` error for the given identity.
    pub fn not_found(identity: &EntityIdentity) -> Self {
        Error::EntityNotFound(EntityNotFoundError {
            identity: identity.clone(),
        })
    }

    /// Build a `ContextClosed` error for the given identity.
    pub fn context_closed(identity: &EntityIdentity, attribute: Option<&'static str>) -> Self {
        Error::ContextClosed(ContextClosedError {
            identity: identity.clone(),
            attribute,
        })
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    ///
    /// Instance state is never changed by a failed load, so retrying the
    /// triggering access is always safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Did the identified row turn out not to exist?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntityNotFound(_))
    }

    /// Was a load attempted through a closed or severed context?
    pub fn is_context_closed(&self) -> bool {
        matches!(self, Error::ContextClosed(_))
    }

    /// The entity identity this error is about, if any.
    pub fn identity(&self) -> Option<&EntityIdentity> {
        match self {
            Error::EntityNotFound(e) => Some(&e.identity),
            Error::IdentityMutation(e) => Some(&e.identity),
            Error::ContextClosed(e) => Some(&e.identity),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EntityNotFound(e) => write!(f, "Entity not found: {}", e),
            Error::IdentityMutation(e) => write!(f, "Identity mutation: {}", e),
            Error::ContextClosed(e) => write!(f, "Context closed: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row exists for {}", self.identity)
    }
}

impl fmt::Display for IdentityMutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot change identifier of {} to {:?}",
            self.identity, self.attempted
        )
    }
}

impl fmt::Display for ContextClosedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attribute {
            Some(attr) => write!(
                f,
                "could not initialize '{}' of {}: no open persistence context",
                attr, self.identity
            ),
            None => write!(
                f,
                "could not initialize {}: no open persistence context",
                self.identity
            ),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<EntityNotFoundError> for Error {
    fn from(err: EntityNotFoundError) -> Self {
        Error::EntityNotFound(err)
    }
}

impl From<IdentityMutationError> for Error {
    fn from(err: IdentityMutationError) -> Self {
        Error::IdentityMutation(err)
    }
}

impl From<ContextClosedError> for Error {
    fn from(err: ContextClosedError) -> Self {
        Error::ContextClosed(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for LazyORM operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn retryable_flags() {
        let deadlock = Error::Query(QueryError::new(
            QueryErrorKind::Deadlock,
            "deadlock detected",
        ));
        assert!(deadlock.is_retryable());

        let constraint = Error::Query(QueryError::new(
            QueryErrorKind::Constraint,
            "unique violation",
        ));
        assert!(!constraint.is_retryable());

        let missing = Error::not_found(&EntityIdentity::new("Human", 1_i64));
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
    }

    #[test]
    fn display_mentions_identity_and_attribute() {
        let identity = EntityIdentity::new("Human", "A Human");
        let closed = Error::context_closed(&identity, Some("age"));
        let msg = closed.to_string();
        assert!(msg.contains("'age'"));
        assert!(msg.contains("Human"));
        assert!(closed.is_context_closed());
        assert_eq!(closed.identity(), Some(&identity));

        let mutation = Error::IdentityMutation(IdentityMutationError {
            identity,
            attempted: Value::Text("Other".to_string()),
        });
        assert!(mutation.to_string().starts_with("Identity mutation"));
    }

    #[test]
    fn query_source_is_exposed() {
        let io = std::io::Error::other("socket reset");
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Connection,
            message: "connection lost".to_string(),
            source: Some(Box::new(io)),
        });
        assert!(std::error::Error::source(&err).is_some());
    }
}
