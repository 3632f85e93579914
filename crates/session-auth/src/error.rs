//! Error types for sign-in and credential file operations

/// Errors from sign-in and credential storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("auth endpoint error: {0}")]
    Endpoint(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<Error> for session_provider::PersistenceError {
    fn from(err: Error) -> Self {
        match err {
            Error::CredentialParse(msg) => session_provider::PersistenceError::Parse(msg),
            other => session_provider::PersistenceError::Io(other.to_string()),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
