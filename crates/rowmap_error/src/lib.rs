//! Error types shared by the rowmap crates.
//!
//! Every mapping operation returns a [`MapperError`] whose [`ErrorKind`]
//! separates the "no rows" sentinel from caller mistakes, programming errors
//! and failures reported by the underlying store.

use std::error::Error;
use std::fmt;

/// Coarse classification of a [`MapperError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The query matched zero rows.
    NotFound,
    /// The request was malformed (bad arguments, missing primary key, ...).
    Validation,
    /// A programming error: record shape mismatches, irreconcilable type
    /// conversions, record type confusion for a table.
    Fatal,
    /// The store rejected or failed a statement.
    Store,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Validation => "validation",
            Self::Fatal => "fatal",
            Self::Store => "store",
        };
        write!(f, "{s}")
    }
}

/// Structured code attached to a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorCode {
    /// Unique or primary key constraint violation.
    Duplicate,
    /// The store reported zero rows where one was required.
    NoRows,
    Other,
}

/// Error reported by a store implementation.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    code: StoreErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        StoreError {
            code: StoreErrorCode::Other,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: StoreErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> StoreErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error is a unique/primary key violation.
    ///
    /// Stores that don't attach a structured code are matched on their
    /// error text.
    pub fn is_duplicate(&self) -> bool {
        if self.code == StoreErrorCode::Duplicate {
            return true;
        }
        let lower = self.message.to_ascii_lowercase();
        lower.contains("duplicate") || lower.contains("unique")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    #[error("no matching rows")]
    NoRows,

    #[error("validation: {0}")]
    Validation(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MapperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoRows => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Store(e) if e.code() == StoreErrorCode::NoRows => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Returns true for the "no matching rows" sentinel, whether produced by
    /// the mapper or reported by the store.
    pub fn is_no_rows(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_duplicate(&self) -> bool {
        match self {
            Self::Store(e) => e.is_duplicate(),
            _ => false,
        }
    }
}

pub type Result<T, E = MapperError> = std::result::Result<T, E>;

/// Build a [`MapperError::Fatal`] from format arguments.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::MapperError::Fatal(std::format!($($arg)*))
    };
}

/// Build a [`MapperError::Validation`] from format arguments.
#[macro_export]
macro_rules! validation {
    ($($arg:tt)*) => {
        $crate::MapperError::Validation(std::format!($($arg)*))
    };
}
