use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirstbootError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot probe cloud-init: {0}")]
    Probe(String),

    #[error("bootloader error: {0}")]
    Bootloader(String),

    #[error("cannot render cloud-init config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FirstbootError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        FirstbootError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
