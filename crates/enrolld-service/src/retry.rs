use std::time::Duration;

use tracing::debug;

use crate::error::ServiceError;

/// Per-attempt retry policy for device service calls.
///
/// HTTP-level errors (5xx) count toward `max_tries`; a certificate-expired
/// error widens the cap to `cert_expired_tries` to tolerate device clocks
/// that have not yet synchronized via NTP. Network-level errors do not
/// count at all by default; an unregistered device busy-waits for
/// connectivity.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_tries: usize,
    pub cert_expired_tries: usize,
    /// Bound on uncounted network retries. `None` waits forever.
    pub network_tries: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_secs(2),
            max_tries: 15,
            cert_expired_tries: 35,
            network_tries: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that fails fast, for tests.
    pub fn immediate(max_tries: usize) -> Self {
        RetryPolicy {
            interval: Duration::from_millis(1),
            max_tries,
            cert_expired_tries: max_tries,
            network_tries: Some(max_tries),
        }
    }

    /// Run `op` until it succeeds, returns a non-retriable error, or the
    /// applicable cap is exhausted (then the last error surfaces).
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let mut counted = 0usize;
        let mut network = 0usize;
        let mut saw_cert_expired = false;

        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            match &err {
                ServiceError::Transport(_) => {
                    network += 1;
                    if let Some(cap) = self.network_tries {
                        if network >= cap {
                            return Err(err);
                        }
                    }
                }
                ServiceError::CertExpired(_) => {
                    saw_cert_expired = true;
                    counted += 1;
                }
                ServiceError::BadStatus { code } if *code >= 500 => {
                    counted += 1;
                }
                ServiceError::CertInvalid(_) => {
                    counted += 1;
                }
                // Anything else is a definitive answer from the service.
                _ => return Err(err),
            }

            let cap = if saw_cert_expired {
                self.cert_expired_tries
            } else {
                self.max_tries
            };
            if counted >= cap {
                return Err(err);
            }

            debug!(what, counted, network, error = %err, "retrying device service call");
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Map a reqwest error to the service error taxonomy. Certificate problems
/// are detected from the error chain text, which is where rustls surfaces
/// them.
pub(crate) fn classify_transport(e: reqwest::Error) -> ServiceError {
    let chain = error_chain(&e);
    let lower = chain.to_lowercase();
    if lower.contains("certificate") && lower.contains("expired") {
        return ServiceError::CertExpired(chain);
    }
    if lower.contains("certificate") {
        return ServiceError::CertInvalid(chain);
    }
    ServiceError::Transport(chain)
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut parts = vec![e.to_string()];
    let mut cur = e.source();
    while let Some(src) = cur {
        parts.push(src.to_string());
        cur = src.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn rejected_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let res: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Rejected("nope".into())) }
            })
            .await;
        assert!(matches!(res, Err(ServiceError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_retry_up_to_cap() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(3);
        let res: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::BadStatus { code: 503 }) }
            })
            .await;
        assert!(matches!(res, Err(ServiceError::BadStatus { code: 503 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cert_expired_widens_the_cap() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            max_tries: 2,
            cert_expired_tries: 4,
            network_tries: Some(10),
        };
        let res: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::CertExpired("clock skew".into())) }
            })
            .await;
        assert!(matches!(res, Err(ServiceError::CertExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn network_errors_do_not_count_toward_http_cap() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            max_tries: 1,
            cert_expired_tries: 1,
            network_tries: Some(5),
        };
        // All failures are network-level; the HTTP cap of 1 must not apply.
        let res: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Transport("refused".into())) }
            })
            .await;
        assert!(matches!(res, Err(ServiceError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn eventual_success_wins() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let res = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ServiceError::BadStatus { code: 500 })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), 42);
    }
}
