// =============================================================================
// ERROR MODULE
// =============================================================================
// Typed errors for the unit lifecycle core.
//
// TAXONOMY:
// - NotFound   : the unit (or its owning item) does not exist. Terminal.
// - Validation : an invariant or a transition precondition failed. Terminal.
// - Conflict   : a uniqueness violation or a stale version. Only the version
//                mismatch is safe to retry after re-reading the unit.
//
// The HTTP layer that consumes this crate maps these to 404 / 400 / 409.
// =============================================================================

use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// CONFLICT DETAILS
// =============================================================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A unique column already holds this value
    Duplicate { field: String, value: String },

    /// The row changed since it was read (compare-and-swap failed)
    VersionMismatch { unit_id: Uuid, expected: i32 },
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::Duplicate { field, value } => {
                write!(f, "{} '{}' already exists", field, value)
            }
            ConflictKind::VersionMismatch { unit_id, expected } => write!(
                f,
                "unit {} was modified concurrently (expected version {})",
                unit_id, expected
            ),
        }
    }
}

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum UnitError {
    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Referenced unit or item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invariant or transition precondition violated
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Uniqueness or optimistic version conflict
    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UnitError {
    pub fn validation(msg: impl Into<String>) -> Self {
        UnitError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        UnitError::NotFound(msg.into())
    }

    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        UnitError::Conflict(ConflictKind::Duplicate {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn version_mismatch(unit_id: Uuid, expected: i32) -> Self {
        UnitError::Conflict(ConflictKind::VersionMismatch { unit_id, expected })
    }

    /// Only a stale version can succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UnitError::Conflict(ConflictKind::VersionMismatch { .. })
        )
    }

    /// Name of the unique field involved, for duplicate conflicts.
    pub fn conflicting_field(&self) -> Option<&str> {
        match self {
            UnitError::Conflict(ConflictKind::Duplicate { field, .. }) => Some(field),
            _ => None,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::NotFound(_) => "not_found",
            UnitError::Validation(_) => "validation",
            UnitError::Conflict(ConflictKind::Duplicate { .. }) => "duplicate",
            UnitError::Conflict(ConflictKind::VersionMismatch { .. }) => "version_mismatch",
            UnitError::Database(_) => "database",
            UnitError::Internal(_) => "internal",
        }
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type UnitResult<T> = Result<T, UnitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_version_mismatch_is_retryable() {
        let id = Uuid::new_v4();
        assert!(UnitError::version_mismatch(id, 3).is_retryable());
        assert!(!UnitError::duplicate("sku", "SKU-1").is_retryable());
        assert!(!UnitError::validation("bad").is_retryable());
        assert!(!UnitError::not_found("gone").is_retryable());
    }

    #[test]
    fn duplicate_names_the_field() {
        let err = UnitError::duplicate("serial_number", "SN123");
        assert_eq!(err.conflicting_field(), Some("serial_number"));
        assert_eq!(
            err.to_string(),
            "Conflict: serial_number 'SN123' already exists"
        );
    }
}
