use async_trait::async_trait;

use crate::assertion::Assertion;
use crate::error::AssertError;

/// Contract of the assertion database collaborator.
///
/// Lookups are by primary key; `add` replaces an existing assertion with
/// the same primary key (the service only ever re-issues equivalent ones).
#[async_trait]
pub trait AssertionDb: Send + Sync + 'static {
    async fn add(&self, assertion: &Assertion) -> Result<(), AssertError>;

    async fn find_serial(
        &self,
        brand: &str,
        model: &str,
        serial: &str,
    ) -> Result<Option<Assertion>, AssertError>;

    async fn find_model(&self, brand: &str, model: &str)
        -> Result<Option<Assertion>, AssertError>;

    /// Look up an account-key by its public key id.
    async fn find_account_key(
        &self,
        public_key_id: &str,
    ) -> Result<Option<Assertion>, AssertError>;
}
