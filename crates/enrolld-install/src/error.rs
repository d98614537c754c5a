use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    /// Secured models cannot fall back to an unencrypted install.
    #[error("cannot encrypt secured device: {0}")]
    SecuredNoTpm(String),

    #[error("cannot use gadget: {0}")]
    Gadget(String),

    #[error("cannot install system: {0}")]
    Fatal(String),

    /// An invariant of the partitioning primitive was violated.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse gadget.yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Assert(#[from] enrolld_assert::AssertError),
}

impl InstallError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        InstallError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
