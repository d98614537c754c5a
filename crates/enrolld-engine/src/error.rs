use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The device service refused the serial request outright.
    #[error("cannot deliver device serial request: {0}")]
    Rejected(String),

    /// A remodel stream carried more than one serial.
    #[error("cannot accept more than a single device serial assertion")]
    DoubleSerial,

    #[error("serial assertion does not match the serial request: {0}")]
    Mismatch(String),

    #[error("prepare-device hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Service(#[from] enrolld_service::ServiceError),

    #[error(transparent)]
    Keystore(#[from] enrolld_keystore::KeystoreError),

    #[error(transparent)]
    Assert(#[from] enrolld_assert::AssertError),

    #[error("internal error: {0}")]
    Internal(String),
}
