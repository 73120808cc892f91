use thiserror::Error;

use confdb_types::Oid;

/// The Error type for backup and restore operations.
///
/// It can represent any kind of error a backup operation might encounter.
#[derive(Error, Debug)]
pub enum Error {
    /// An IO error (backup file not found, access forbidden, etc...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The document is not well-formed XML.
    #[error("malformed backup document: {0}")]
    Document(#[from] xml::reader::Error),
    /// The document could not be emitted.
    #[error("backup write error: {0}")]
    Emit(#[from] xml::writer::Error),
    /// A database reply other than success.
    #[error("{0}")]
    Db(#[from] confdb_types::Error),
    /// The live state does not match the backup document.
    #[error("live state diverges from the backup at '{oid}'")]
    Diverged {
        /// The first identifier found to diverge.
        oid: Oid,
    },
}

impl Error {
    /// Whether this error is the recoverable missing-prerequisite case the
    /// restore loop retries on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Db(err) if err.is_not_found())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::Db(confdb_types::Error::Invalid(message.into()))
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Error::Db(confdb_types::Error::NotFound(message.into()))
    }
}
