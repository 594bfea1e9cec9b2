//! Error taxonomy shared by every Xodel crate.
//!
//! Construction problems are fatal at setup and leave no partially usable
//! model. Validation failures carry the field name, a display label, and an
//! optional element index so callers can point at the exact offending value.
//! Execution errors from the query collaborator pass through unmodified.

use serde_json::Value;
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// A single field failing validation.
///
/// `index` is set when the failure happened inside an array or nested table
/// field and identifies the offending element row.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{label}: {message}")]
pub struct ValidationError {
    /// Field name as declared on the model.
    pub name: String,
    /// Human-readable failure message.
    pub message: String,
    /// Display label of the field (falls back to the name).
    pub label: String,
    /// Element index for array/table fields.
    pub index: Option<usize>,
    /// The raw value that failed.
    pub value: Value,
}

impl ValidationError {
    pub fn new(name: impl Into<String>, message: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            message: message.into(),
            index: None,
            value,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Top-level error for model construction, validation, and statement
/// rendering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed model or field spec. Fatal at setup time.
    #[error("model construction failed: {0}")]
    Construction(String),

    /// A field value failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A row in a bulk operation failed validation.
    #[error("row {batch_index}: {inner}")]
    BatchValidation {
        inner: ValidationError,
        batch_index: usize,
    },

    /// A lookup or update matched zero rows.
    #[error("{0}")]
    NotFound(String),

    /// A statement matched an unexpected number of rows.
    #[error("{0}")]
    Integrity(String),

    /// A value cannot be rendered as a SQL literal or token.
    #[error("cannot encode value as sql: {0}")]
    Encoding(String),

    /// Pass-through failure from the query or schema collaborator.
    #[error("{0}")]
    Query(String),
}

impl Error {
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction(message.into())
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub fn batch(inner: ValidationError, batch_index: usize) -> Self {
        Self::BatchValidation { inner, batch_index }
    }

    /// The field-level failure inside this error, if any.
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(inner) => Some(inner),
            Self::BatchValidation { inner, .. } => Some(inner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_error_display_uses_label() {
        let err = ValidationError::new("age", "value must be at least 0", json!(-1))
            .with_label("Age");
        assert_eq!(err.to_string(), "Age: value must be at least 0");
        assert_eq!(err.name, "age");
    }

    #[test]
    fn test_label_defaults_to_name() {
        let err = ValidationError::new("email", "bad address", json!("x"));
        assert_eq!(err.label, "email");
    }

    #[test]
    fn test_batch_error_carries_row_index() {
        let inner = ValidationError::new("name", "required", Value::Null);
        let err = Error::batch(inner, 3);
        assert!(err.to_string().starts_with("row 3:"));
        assert_eq!(err.validation().unwrap().name, "name");
    }

    #[test]
    fn test_validation_accessor() {
        let err = Error::construction("bad spec");
        assert!(err.validation().is_none());
        let err: Error = ValidationError::new("f", "m", Value::Null).into();
        assert_eq!(err.validation().unwrap().message, "m");
    }
}
