use std::fmt::Display;

use sqlx::{error::DatabaseError, sqlite::SqliteError};
use thiserror::Error as ThisError;
use tracing_error::SpanTrace;

#[derive(ThisError, Debug)]
pub enum ErrorType {
    #[error("Internal error")]
    Storage(sqlx::Error),
    #[error("Internal error")]
    InternalError(anyhow::Error),
    #[error("Internal error")]
    BadData(String),
    #[error("{0}")]
    InputValidation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("A resource with that identifier already exists")]
    UniqueConstraintViolation {
        #[source]
        error: sqlx::Error,
    },
    #[error("The resource update was not processable")]
    ForeignKeyViolation {
        #[source]
        error: sqlx::Error,
    },
    #[error("Restriction method `{method}` is not registered")]
    MethodNotRegistered { method: String },
    #[error("Restriction method `{method}` is already registered")]
    DuplicateMethod { method: String },
    #[error("Tokenizer key `{key_id}` is not available")]
    UnknownTokenizerKey { key_id: String },
    #[error("Tokenizer oracle failure")]
    Oracle(#[source] anyhow::Error),
}

#[derive(ThisError, Debug)]
pub struct Error {
    pub variant: ErrorType,
    pub span_trace: SpanTrace,
}

impl Error {
    /// True when the error is a unique-constraint violation. Inside the
    /// acquire loop this means another writer created the record first and
    /// the operation should re-read and retry.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self.variant, ErrorType::UniqueConstraintViolation { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.variant, self.span_trace)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        #[allow(clippy::redundant_closure_for_method_calls)]
        if let Some(error_code) = err
            .as_database_error()
            .and_then(|db_err| db_err.try_downcast_ref::<SqliteError>())
        {
            if let Some(code) = error_code.code().map(|str| str.to_string()) {
                match &code[..] {
                    // FK constraint violation
                    "787" => {
                        return Self {
                            variant: ErrorType::ForeignKeyViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    // UNIQUE / PRIMARY KEY constraint violation
                    "1555" | "2067" => {
                        return Self {
                            variant: ErrorType::UniqueConstraintViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    _ => {}
                }
            }
        }
        Self {
            variant: ErrorType::Storage(err),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<ErrorType> for Error {
    fn from(err: ErrorType) -> Self {
        Self {
            variant: err,
            span_trace: SpanTrace::capture(),
        }
    }
}
