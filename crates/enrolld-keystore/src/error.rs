use enrolld_domain::KeyId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("device key not found: {0}")]
    NotFound(KeyId),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device key must be at least {min} bits, got {bits}")]
    KeyTooShort { bits: usize, min: usize },

    #[error("key material error: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    BadSignature,
}

impl KeystoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        KeystoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
