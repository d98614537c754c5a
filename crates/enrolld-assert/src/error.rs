use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssertError {
    #[error("signature verification failed")]
    Signature,

    #[error("assertion does not match request: {0}")]
    Mismatch(String),

    #[error("malformed assertion stream: {0}")]
    MalformedStream(String),

    #[error("assertion not found: {0}")]
    NotFound(String),

    #[error("assertion encoding error: {0}")]
    Encode(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for AssertError {
    fn from(e: serde_json::Error) -> Self {
        AssertError::Encode(e.to_string())
    }
}

impl AssertError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        AssertError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
