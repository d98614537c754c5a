use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Network-level failure: no route, DNS, connection refused, timeout.
    #[error("cannot reach device service: {0}")]
    Transport(String),

    #[error("unexpected status {code} from device service")]
    BadStatus { code: u16 },

    /// Structured service-level refusal (4xx with an error_list body).
    #[error("cannot deliver device serial request: {0}")]
    Rejected(String),

    #[error("malformed assertion stream: {0}")]
    MalformedStream(String),

    /// The server certificate looks expired, usually a device clock that
    /// has not yet synchronized. Retried against a widened cap.
    #[error("device service certificate expired: {0}")]
    CertExpired(String),

    /// Any other TLS certificate validation failure.
    #[error("device service certificate invalid: {0}")]
    CertInvalid(String),

    /// The service answered with a shape we cannot make sense of.
    #[error("unexpected device service response: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Assert(#[from] enrolld_assert::AssertError),
}

impl ServiceError {
    /// Whether another attempt could plausibly succeed without operator or
    /// service intervention.
    pub fn is_retriable(&self) -> bool {
        match self {
            ServiceError::Transport(_) | ServiceError::CertExpired(_) => true,
            ServiceError::BadStatus { code } => *code >= 500,
            _ => false,
        }
    }
}
