use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] enrolld_engine::EngineError),

    #[error(transparent)]
    Keystore(#[from] enrolld_keystore::KeystoreError),

    #[error(transparent)]
    Assert(#[from] enrolld_assert::AssertError),

    #[error(transparent)]
    Firstboot(#[from] enrolld_firstboot::FirstbootError),

    #[error(transparent)]
    Install(#[from] enrolld_install::InstallError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ManagerError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
