//! Engine Error Types

use std::io;
use thiserror::Error;

/// Broad error classification used by the HTTP layer and the public API.
///
/// Every [`GraphError`] maps to exactly one kind; the mapping is the
/// contract, the variants below carry the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Conflict,
    Io,
    Upstream,
    Parse,
    Cancelled,
    ResourceExhausted,
    Internal,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum GraphError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot encode/decode error
    #[error("snapshot codec error: {0}")]
    Snapshot(#[from] bincode::Error),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Entity not found
    #[error("entity '{0}' not found in the graph")]
    EntityNotFound(String),

    /// Node not found (entity, class-instance node, or class)
    #[error("node '{0}' not found in the graph")]
    NodeNotFound(String),

    /// Class not defined in the system catalog
    #[error("class '{0}' is not defined in the system")]
    ClassNotDefined(String),

    /// Property not declared on a class
    #[error("property '{1}' is not declared on class '{0}'")]
    PropertyNotDeclared(String, String),

    /// A value-required property is missing its value
    #[error("property '{1}' of class '{0}' requires a non-empty value")]
    PropertyValueRequired(String, String),

    /// Relationship endpoint does not exist as any node kind
    #[error("relationship endpoint '{0}' does not exist in the graph")]
    MissingEndpoint(String),

    /// Database file not found
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Database file already exists
    #[error("database already exists: {0}")]
    DatabaseExists(String),

    /// Cannot delete the database currently in use
    #[error("cannot delete the database currently in use: {0}")]
    CannotDeleteCurrent(String),

    /// Malformed input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Completion service failure
    #[error("completion service error: {0}")]
    Upstream(String),

    /// Unusable reply from the completion service
    #[error("parse error: {0}")]
    Parse(String),

    /// Task was cancelled
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// Task backlog exceeds the configured ceiling
    #[error("task backlog full: {0}")]
    ResourceExhausted(String),

    /// Generic error
    #[error("{0}")]
    Internal(String),
}

impl GraphError {
    /// Classify this error into its envelope kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Io(_) | GraphError::Snapshot(_) => ErrorKind::Io,
            GraphError::TaskNotFound(_)
            | GraphError::EntityNotFound(_)
            | GraphError::NodeNotFound(_)
            | GraphError::ClassNotDefined(_)
            | GraphError::DatabaseNotFound(_) => ErrorKind::NotFound,
            GraphError::PropertyNotDeclared(_, _)
            | GraphError::PropertyValueRequired(_, _)
            | GraphError::MissingEndpoint(_)
            | GraphError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            GraphError::DatabaseExists(_) | GraphError::CannotDeleteCurrent(_) => {
                ErrorKind::Conflict
            }
            GraphError::Upstream(_) => ErrorKind::Upstream,
            GraphError::Parse(_) => ErrorKind::Parse,
            GraphError::Cancelled(_) => ErrorKind::Cancelled,
            GraphError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            GraphError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for engine operations
pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds() {
        assert_eq!(
            GraphError::TaskNotFound("t1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GraphError::EntityNotFound("Wechat".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GraphError::DatabaseNotFound("graph.kg".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_conflict_kinds() {
        assert_eq!(
            GraphError::DatabaseExists("graph.kg".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            GraphError::CannotDeleteCurrent("graph.kg".into()).kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_validation_kinds() {
        assert_eq!(
            GraphError::MissingEndpoint("user".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            GraphError::PropertyValueRequired("Person".into(), "age".into()).kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_io_kind_covers_snapshot_codec() {
        let err = GraphError::Io(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_display_carries_detail() {
        let err = GraphError::ClassNotDefined("Platform".into());
        assert_eq!(err.to_string(), "class 'Platform' is not defined in the system");
    }
}
