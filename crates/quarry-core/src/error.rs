//! Core error types for quarry.
//!
//! [`QuarryError`] covers the whole taxonomy of the query engine: lookup
//! cardinality errors (`NotFound`, `MultipleRows`), scan-time conversion
//! failures, bad field paths, configuration errors raised while registering
//! models, and errors reported by database backends.
//!
//! Errors fall into two groups. Structural errors ([`QuarryError::is_configuration`])
//! are detected eagerly at registration or query-build time and are never
//! retried. Data-access errors ([`QuarryError::is_data_access`]) are handed to
//! the caller for programmatic handling.

use std::time::Duration;

use thiserror::Error;

/// The primary error type for quarry.
///
/// The enum is `Clone` so that a failure captured while a query is being
/// built can be reported again by every terminal call made on that query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuarryError {
    // ── Cardinality ──────────────────────────────────────────────────

    /// A query expected exactly one row but found none.
    #[error("no rows: {0}")]
    NotFound(String),

    /// A query expected exactly one row but found several.
    #[error("multiple rows returned when one expected: {0}")]
    MultipleRows(String),

    // ── Conversion ───────────────────────────────────────────────────

    /// A value could not be converted to the Rust type of a field.
    ///
    /// `field` is empty when the conversion happened outside of a field
    /// context (for example `Row::get`); scanning code fills it in.
    #[error("type mismatch for field `{field}`: expected {expected}, found {found}")]
    TypeMismatch {
        /// The field being populated.
        field: String,
        /// The Rust type the field stores.
        expected: String,
        /// The kind of value that was found.
        found: String,
    },

    // ── Paths and relations ──────────────────────────────────────────

    /// A path segment does not name a field or relation on the model.
    #[error("unknown field `{field}` on model {model}; valid fields: {}", .valid.join(", "))]
    UnknownField {
        /// The model the segment was resolved against.
        model: String,
        /// The offending segment.
        field: String,
        /// Every name that would have been accepted.
        valid: Vec<String>,
    },

    /// A relation could not be resolved to a registered model.
    #[error("unknown relation `{name}` on model {model}")]
    UnknownRelation {
        /// The model owning the relation.
        model: String,
        /// The relation name or content-type key.
        name: String,
    },

    /// The operation is not supported for this relation shape.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // ── Configuration ────────────────────────────────────────────────

    /// Model or relation configuration is invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    // ── Database ─────────────────────────────────────────────────────

    /// A generic database error.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// A database integrity constraint was violated.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// An operational database error (connection failure, etc.).
    #[error("operational error: {0}")]
    OperationalError(String),

    /// The caller cancelled the query.
    #[error("query cancelled: {0}")]
    Cancelled(String),

    /// The query did not finish within its timeout.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    // ── Serialization and IO ─────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    IoError(String),
}

impl QuarryError {
    /// Builds a [`QuarryError::TypeMismatch`] without a field name.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            field: String::new(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Attaches a field name to a [`QuarryError::TypeMismatch`].
    ///
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_field(self, name: &str) -> Self {
        match self {
            Self::TypeMismatch {
                expected, found, ..
            } => Self::TypeMismatch {
                field: name.to_string(),
                expected,
                found,
            },
            other => other,
        }
    }

    /// Returns `true` for [`QuarryError::NotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for [`QuarryError::MultipleRows`].
    pub const fn is_multiple_rows(&self) -> bool {
        matches!(self, Self::MultipleRows(_))
    }

    /// Returns `true` for errors detected while registering models or
    /// building a query.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationError(_)
                | Self::UnknownField { .. }
                | Self::UnknownRelation { .. }
                | Self::NotImplemented(_)
        )
    }

    /// Returns `true` for errors produced while talking to the database or
    /// scanning its results.
    pub const fn is_data_access(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::MultipleRows(_)
                | Self::TypeMismatch { .. }
                | Self::DatabaseError(_)
                | Self::IntegrityError(_)
                | Self::OperationalError(_)
                | Self::Cancelled(_)
                | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for QuarryError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A convenience type alias for `Result<T, QuarryError>`.
pub type QuarryResult<T> = Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_field_lists_valid_names() {
        let err = QuarryError::UnknownField {
            model: "Todo".into(),
            field: "Titel".into(),
            valid: vec!["ID".into(), "Title".into(), "Done".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown field `Titel` on model Todo; valid fields: ID, Title, Done"
        );
    }

    #[test]
    fn test_type_mismatch_with_field() {
        let err = QuarryError::type_mismatch("i64", "String").with_field("ID");
        assert_eq!(
            err.to_string(),
            "type mismatch for field `ID`: expected i64, found String"
        );
    }

    #[test]
    fn test_with_field_leaves_other_variants() {
        let err = QuarryError::NotFound("todo".into()).with_field("ID");
        assert_eq!(err, QuarryError::NotFound("todo".into()));
    }

    #[test]
    fn test_classification() {
        assert!(QuarryError::NotFound("x".into()).is_not_found());
        assert!(QuarryError::MultipleRows("x".into()).is_multiple_rows());
        assert!(QuarryError::ConfigurationError("x".into()).is_configuration());
        assert!(!QuarryError::ConfigurationError("x".into()).is_data_access());
        assert!(QuarryError::Timeout(Duration::from_millis(5)).is_data_access());
        assert!(QuarryError::Cancelled("x".into()).is_data_access());
        assert!(QuarryError::UnknownRelation {
            model: "Todo".into(),
            name: "Owner".into()
        }
        .is_configuration());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: QuarryError = io_err.into();
        assert!(err.to_string().contains("file missing"));
    }
}
