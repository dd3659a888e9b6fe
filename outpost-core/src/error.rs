use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::io;
use std::sync::OnceLock;
use thiserror::Error;

const PERMISSION_HINT: &str =
    "The backend rejected this request. Check the table's access policies or sign in with an account that has access.";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String, hint: String },

    #[error("Version conflict: current version is {current_version}, attempted {attempted_version}")]
    VersionConflict {
        current_version: i64,
        attempted_version: i64,
    },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Schema mismatch on field '{field}': {message}")]
    SchemaMismatch { field: String, message: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured failure handed to calling layers instead of an exception.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
    pub details: Value,
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Error::AuthRequired => "AUTH_REQUIRED",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::DuplicateKey(_) => "DUPLICATE_KEY",
            Error::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            Error::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidRecord(_) => "INVALID_RECORD",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Remote(_) => "REMOTE_ERROR",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the condition is environmental and may clear up on its own.
    ///
    /// Retryable errors send the router down the local fallback path and keep
    /// queue entries queued. Logical errors are surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NetworkUnavailable(_) => true,
            Error::Remote(_) => true,
            Error::Io(_) => true,
            Error::ResourceExhausted(_) => true,

            Error::AuthRequired => false,
            Error::PermissionDenied { .. } => false,
            Error::VersionConflict { .. } => false,
            Error::DuplicateKey(_) => false,
            Error::ForeignKeyViolation(_) => false,
            Error::SchemaMismatch { .. } => false,
            Error::NotFound(_) => false,
            Error::InvalidRecord(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Storage(_) => false,
            Error::Serialization(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Returns true if a queued mutation failing with this error can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey(_) | Error::NotFound(_) | Error::InvalidRecord(_)
        )
    }

    /// Machine-readable details for the structured failure.
    pub fn details(&self) -> Value {
        match self {
            Error::VersionConflict {
                current_version,
                attempted_version,
            } => json!({
                "currentVersion": current_version,
                "attemptedVersion": attempted_version,
            }),
            Error::PermissionDenied { hint, .. } => json!({ "hint": hint }),
            Error::SchemaMismatch { field, .. } => json!({ "field": field }),
            _ => Value::Null,
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            success: false,
            error: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    /// Adds context to an error by wrapping it in an Internal error.
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }

    pub fn permission_denied(message: impl Into<String>) -> Error {
        Error::PermissionDenied {
            message: message.into(),
            hint: PERMISSION_HINT.to_string(),
        }
    }

    /// Maps an error reported by the remote backend onto the taxonomy.
    ///
    /// `code` is the backend error code (PostgREST or Postgres SQLSTATE),
    /// `status` the HTTP status if one is known.
    pub fn from_remote(code: Option<&str>, status: Option<u16>, message: &str) -> Error {
        match code {
            Some("PGRST116") => return Error::NotFound(message.to_string()),
            Some("42501") => return Error::permission_denied(message),
            Some("23505") => return Error::DuplicateKey(message.to_string()),
            Some("23503") => return Error::ForeignKeyViolation(message.to_string()),
            Some("42703") | Some("PGRST204") => {
                return Error::SchemaMismatch {
                    field: extract_column(message).unwrap_or_else(|| "unknown".to_string()),
                    message: message.to_string(),
                }
            }
            Some("PGRST301") | Some("PGRST302") => return Error::AuthRequired,
            _ => {}
        }

        match status {
            Some(401) => Error::AuthRequired,
            Some(403) => Error::permission_denied(message),
            Some(404) => Error::NotFound(message.to_string()),
            Some(409) => Error::DuplicateKey(message.to_string()),
            _ => Error::Remote(message.to_string()),
        }
    }
}

/// Pulls the offending column name out of a backend schema error message.
pub fn extract_column(message: &str) -> Option<String> {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"'(\w+)' column").expect("valid regex"),
            Regex::new(r#"column "?(?:\w+\.)?(\w+)"?"#).expect("valid regex"),
        ]
    });

    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::AuthRequired.code(), "AUTH_REQUIRED");
        assert_eq!(Error::DuplicateKey("x".into()).code(), "DUPLICATE_KEY");
        assert_eq!(
            Error::NetworkUnavailable("down".into()).code(),
            "NETWORK_UNAVAILABLE"
        );
    }

    #[test]
    fn test_version_conflict_details() {
        let err = Error::VersionConflict {
            current_version: 3,
            attempted_version: 2,
        };
        let failure = err.to_failure();
        assert!(!failure.success);
        assert_eq!(failure.error, "VERSION_CONFLICT");
        assert_eq!(failure.details["currentVersion"], 3);
        assert_eq!(failure.details["attemptedVersion"], 2);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NetworkUnavailable("x".into()).is_retryable());
        assert!(!Error::permission_denied("no").is_retryable());
        assert!(Error::NotFound("x".into()).is_permanent());
        assert!(!Error::Remote("500".into()).is_permanent());
    }

    #[test]
    fn test_from_remote_codes() {
        assert!(matches!(
            Error::from_remote(Some("23505"), Some(409), "duplicate key value"),
            Error::DuplicateKey(_)
        ));
        assert!(matches!(
            Error::from_remote(Some("23503"), Some(409), "violates foreign key"),
            Error::ForeignKeyViolation(_)
        ));
        assert!(matches!(
            Error::from_remote(None, Some(401), "jwt expired"),
            Error::AuthRequired
        ));
        assert!(matches!(
            Error::from_remote(None, Some(503), "unavailable"),
            Error::Remote(_)
        ));
    }

    #[test]
    fn test_schema_mismatch_extracts_field() {
        let err = Error::from_remote(
            Some("PGRST204"),
            Some(400),
            "Could not find the 'grade_level' column of 'students' in the schema cache",
        );
        match err {
            Error::SchemaMismatch { field, .. } => assert_eq!(field, "grade_level"),
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(
            extract_column(r#"column "discount" of relation "fees" does not exist"#),
            Some("discount".to_string())
        );
        assert_eq!(
            extract_column("column fees.discount does not exist"),
            Some("discount".to_string())
        );
    }
}
