use thiserror::Error;

/// The error type written into every database reply.
///
/// The variants mirror the status codes of the message surface: a request
/// either succeeds or comes back with one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request is malformed (bad identifier, type mismatch, etc...).
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The named object or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The named object, instance or dependency edge already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The access mode of the object forbids the requested operation.
    #[error("operation forbidden: {0}")]
    Forbidden(String),
}

impl Error {
    /// Whether this error is the recoverable missing-prerequisite case.
    ///
    /// The restore loop retries on it instead of failing the operation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
