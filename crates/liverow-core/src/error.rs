//! Error types for engine operations.

use std::fmt;

/// The primary error type for all engine operations.
#[derive(Debug)]
pub enum Error {
    /// An operation was called with an unusable argument shape
    ParamMismatch(String),
    /// A lookup by key matched no row
    NotFound(String),
    /// The requested model, association, or state does not exist
    NotDefined(String),
    /// The engine or driver does not support the requested feature or type
    NoSupport(String),
    /// A schema could not be compiled into a usable model
    BadModel(String),
    /// A driver operation failed
    Query(QueryError),
    /// One or more validation rules rejected instance data
    Validation(Vec<ValidationFailure>),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// Failure raised by a driver while executing an operation.
#[derive(Debug)]
pub struct QueryError {
    pub message: String,
    pub code: Option<String>,
    pub table: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a query error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            table: None,
            source: None,
        }
    }

    /// Attach the table the operation targeted.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// A single validation rule rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// The property that failed validation
    pub property: String,
    /// The rule that rejected the value
    pub rule: String,
    /// Human-readable error message
    pub message: String,
}

impl ValidationFailure {
    pub fn new(
        property: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            property: property.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

impl Error {
    /// Standard not-found error for a keyed lookup on a table.
    pub fn not_found(table: &str) -> Self {
        Error::NotFound(format!("no row found in '{table}' for the given keys"))
    }

    /// The failures carried by a validation error, if this is one.
    pub fn validation_failures(&self) -> Option<&[ValidationFailure]> {
        match self {
            Error::Validation(failures) => Some(failures),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParamMismatch(msg) => write!(f, "Parameter mismatch: {msg}"),
            Error::NotFound(msg) => write!(f, "Not found: {msg}"),
            Error::NotDefined(msg) => write!(f, "Not defined: {msg}"),
            Error::NoSupport(msg) => write!(f, "Not supported: {msg}"),
            Error::BadModel(msg) => write!(f, "Bad model: {msg}"),
            Error::Query(e) => {
                if let Some(code) = &e.code {
                    write!(f, "Query error ({code}): {}", e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Validation(failures) => match failures.len() {
                0 => write!(f, "validation passed"),
                1 => write!(
                    f,
                    "validation error on '{}': {}",
                    failures[0].property, failures[0].message
                ),
                _ => {
                    writeln!(f, "validation errors:")?;
                    for failure in failures {
                        writeln!(f, "  - {}: {}", failure.property, failure.message)?;
                    }
                    Ok(())
                }
            },
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{msg}"),
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
            _ => None,
        }
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
