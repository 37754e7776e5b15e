//! Error types for the district data model
//!
//! [`CoreError`] covers everything that can go wrong while assembling an
//! environment or an entity hierarchy and while reading the schedule store.
//! The algorithm crate converts these into its own scheduling errors.

use thiserror::Error;

use crate::EntityId;

/// Error type for data model operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Parameter or series validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// An entity was attached somewhere the hierarchy does not allow
    #[error("Hierarchy error: {0}")]
    Hierarchy(String),

    /// A named schedule does not exist for an entity
    #[error("no schedule '{name}' stored for entity {entity}")]
    ScheduleNotFound { entity: EntityId, name: String },

    /// Another run currently holds the hierarchy
    #[error("another scheduling run holds this district")]
    RunInProgress,

    /// Parsing errors for selectors given as text
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convenience type alias for Results using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Validation(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Validation(s.to_string())
    }
}
