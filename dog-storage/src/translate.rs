//! Normalizes backend failures into [`StorageError`].
//!
//! Gateways never hand concrete SDK errors to the façade. They wrap them in a
//! [`GatewayError`] that advertises whether the backend said "this object does
//! not exist", along with the backend's diagnostic code and message. Everything
//! above the gateway decides through [`classify`] alone.

use thiserror::Error;

use crate::error::{BoxError, Operation};
use crate::StorageError;

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// What a backend failure says about the addressed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignal {
    /// Read/delete of a key that does not exist
    NoSuchKey,
    /// Metadata lookup of a key that does not exist
    NotFound,
    Other,
}

/// A failure reported by an [`ObjectGateway`](crate::ObjectGateway)
#[derive(Error, Debug)]
pub struct GatewayError {
    pub signal: ErrorSignal,
    pub code: Option<String>,
    pub message: Option<String>,
    #[source]
    pub source: BoxError,
}

impl GatewayError {
    pub fn new<E>(signal: ErrorSignal, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            signal,
            code: None,
            message: None,
            source: Box::new(error),
        }
    }

    /// Failure without a not-found signal
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorSignal::Other, error)
    }

    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    fn describe(&self) -> String {
        match (&self.message, &self.code) {
            (Some(message), Some(code)) => format!("{} (code: {})", message, code),
            (Some(message), None) => message.clone(),
            (None, Some(code)) => format!("{} ({})", code, self.source),
            (None, None) => self.source.to_string(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// The only distinction callers above the gateway care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Missing,
    Failure,
}

pub fn classify(error: &GatewayError) -> ErrorClass {
    match error.signal {
        ErrorSignal::NoSuchKey | ErrorSignal::NotFound => ErrorClass::Missing,
        ErrorSignal::Other => ErrorClass::Failure,
    }
}

/// Map a gateway failure for `container/key` onto the façade taxonomy.
///
/// A missing object is `NotFound` on every read path; a save never reports
/// it, since there is nothing to find.
pub fn translate(operation: Operation, container: &str, key: &str, error: GatewayError) -> StorageError {
    match (classify(&error), operation) {
        (ErrorClass::Missing, Operation::Open | Operation::Download | Operation::Exists | Operation::Delete) => {
            StorageError::not_found(container, key)
        }
        _ => StorageError::Transfer {
            operation,
            container: container.to_string(),
            key: key.to_string(),
            code: error.code.clone(),
            message: error.message.clone().unwrap_or_else(|| error.source.to_string()),
            source: Box::new(error),
        },
    }
}

/// Existence checks turn a missing object into `false` instead of an error
pub fn translate_exists(container: &str, key: &str, result: GatewayResult<()>) -> Result<bool, StorageError> {
    match result {
        Ok(()) => Ok(true),
        Err(error) if classify(&error) == ErrorClass::Missing => Ok(false),
        Err(error) => Err(translate(Operation::Exists, container, key, error)),
    }
}
