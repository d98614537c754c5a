use enrolld_domain::ModelGrade;
use tracing::{info, warn};

use crate::error::InstallError;

/// Probes whether a TPM suitable for key sealing is present.
pub trait TpmProbe: Send + Sync + 'static {
    /// `Err(reason)` when no usable TPM is available.
    fn available(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionDecision {
    Encrypt,
    Unencrypted,
}

/// Decide whether the data partitions get encrypted.
///
/// `Secured` requires a TPM, full stop. `Signed` and `Dangerous` use one
/// when present, unless the seed carries the `.force-unencrypted`
/// sentinel; without a TPM they fall back to unencrypted.
pub fn decide_encryption(
    grade: ModelGrade,
    tpm: &dyn TpmProbe,
    force_unencrypted: bool,
) -> Result<EncryptionDecision, InstallError> {
    if force_unencrypted {
        if grade.allows_force_unencrypted() {
            info!(%grade, "seed opts out of encryption");
            return Ok(EncryptionDecision::Unencrypted);
        }
        warn!("ignoring .force-unencrypted on a secured model");
    }

    match tpm.available() {
        Ok(()) => Ok(EncryptionDecision::Encrypt),
        Err(reason) if grade.requires_encryption() => Err(InstallError::SecuredNoTpm(reason)),
        Err(reason) => {
            info!(%grade, %reason, "no TPM, installing unencrypted");
            Ok(EncryptionDecision::Unencrypted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tpm(Option<&'static str>);

    impl TpmProbe for Tpm {
        fn available(&self) -> Result<(), String> {
            match self.0 {
                None => Ok(()),
                Some(reason) => Err(reason.to_string()),
            }
        }
    }

    #[test]
    fn secured_without_tpm_is_fatal() {
        let err =
            decide_encryption(ModelGrade::Secured, &Tpm(Some("no tpm device")), false).unwrap_err();
        assert!(err.to_string().contains("cannot encrypt secured device"));
    }

    #[test]
    fn secured_with_tpm_encrypts() {
        assert_eq!(
            decide_encryption(ModelGrade::Secured, &Tpm(None), false).unwrap(),
            EncryptionDecision::Encrypt
        );
    }

    #[test]
    fn secured_ignores_force_unencrypted() {
        let err =
            decide_encryption(ModelGrade::Secured, &Tpm(Some("no tpm")), true).unwrap_err();
        assert!(matches!(err, InstallError::SecuredNoTpm(_)));
        assert_eq!(
            decide_encryption(ModelGrade::Secured, &Tpm(None), true).unwrap(),
            EncryptionDecision::Encrypt
        );
    }

    #[test]
    fn dangerous_without_tpm_falls_back() {
        assert_eq!(
            decide_encryption(ModelGrade::Dangerous, &Tpm(Some("no tpm")), false).unwrap(),
            EncryptionDecision::Unencrypted
        );
    }

    #[test]
    fn signed_without_tpm_falls_back() {
        assert_eq!(
            decide_encryption(ModelGrade::Signed, &Tpm(Some("no tpm")), false).unwrap(),
            EncryptionDecision::Unencrypted
        );
    }

    #[test]
    fn sentinel_wins_over_available_tpm() {
        for grade in [ModelGrade::Dangerous, ModelGrade::Signed] {
            assert_eq!(
                decide_encryption(grade, &Tpm(None), true).unwrap(),
                EncryptionDecision::Unencrypted
            );
        }
    }
}
