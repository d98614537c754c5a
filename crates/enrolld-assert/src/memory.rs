use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::assertion::{Assertion, AssertionContent};
use crate::db::AssertionDb;
use crate::error::AssertError;

#[derive(Debug, Default)]
struct Inner {
    serials: HashMap<(String, String, String), Assertion>,
    models: HashMap<(String, String), Assertion>,
    accounts: HashMap<String, Assertion>,
    account_keys: HashMap<String, Assertion>,
}

/// In-memory implementation of [`AssertionDb`].
///
/// All data is lost on process exit. Suitable for tests and install mode,
/// where the staging database is rebuilt from the seed anyway.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssertionDb {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryAssertionDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of held assertions, across all kinds.
    pub async fn len(&self) -> usize {
        let guard = self.inner.read().await;
        guard.serials.len() + guard.models.len() + guard.accounts.len() + guard.account_keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AssertionDb for MemoryAssertionDb {
    async fn add(&self, assertion: &Assertion) -> Result<(), AssertError> {
        let mut guard = self.inner.write().await;
        match &assertion.content {
            AssertionContent::Serial(s) => {
                guard.serials.insert(
                    (s.brand_id.clone(), s.model.clone(), s.serial.clone()),
                    assertion.clone(),
                );
            }
            AssertionContent::Model(m) => {
                guard
                    .models
                    .insert((m.brand_id.clone(), m.model.clone()), assertion.clone());
            }
            AssertionContent::Account(a) => {
                guard.accounts.insert(a.account_id.clone(), assertion.clone());
            }
            AssertionContent::AccountKey(k) => {
                guard
                    .account_keys
                    .insert(k.public_key_id.clone(), assertion.clone());
            }
            AssertionContent::SerialRequest(_) => {
                // Requests are transient; the database only holds statements.
                return Err(AssertError::Encode(
                    "serial-request assertions are not storable".into(),
                ));
            }
        }
        Ok(())
    }

    async fn find_serial(
        &self,
        brand: &str,
        model: &str,
        serial: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        let guard = self.inner.read().await;
        Ok(guard
            .serials
            .get(&(brand.to_string(), model.to_string(), serial.to_string()))
            .cloned())
    }

    async fn find_model(
        &self,
        brand: &str,
        model: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        let guard = self.inner.read().await;
        Ok(guard
            .models
            .get(&(brand.to_string(), model.to_string()))
            .cloned())
    }

    async fn find_account_key(
        &self,
        public_key_id: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        let guard = self.inner.read().await;
        Ok(guard.account_keys.get(public_key_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::SerialContent;
    use chrono::Utc;
    use enrolld_keystore::{DeviceKey, MIN_KEY_BITS};

    fn signed_serial(brand: &str, model: &str, serial: &str) -> Assertion {
        let key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        Assertion::sign(
            AssertionContent::Serial(SerialContent {
                authority_id: brand.to_string(),
                brand_id: brand.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                device_key: "ignored".into(),
                device_key_fingerprint: "ignored".into(),
                timestamp: Utc::now(),
            }),
            &key,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_and_find_serial() {
        let db = MemoryAssertionDb::new();
        let a = signed_serial("canonical", "pc", "9999");
        db.add(&a).await.unwrap();

        let found = db.find_serial("canonical", "pc", "9999").await.unwrap();
        assert_eq!(found, Some(a));
        assert!(db
            .find_serial("canonical", "pc", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn serial_requests_are_rejected() {
        use crate::assertion::SerialRequestContent;
        let key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let req = Assertion::sign(
            AssertionContent::SerialRequest(SerialRequestContent {
                brand_id: "b".into(),
                model: "m".into(),
                request_id: "r".into(),
                device_key: "k".into(),
                serial: None,
                body: None,
            }),
            &key,
        )
        .unwrap();

        let db = MemoryAssertionDb::new();
        assert!(db.add(&req).await.is_err());
        assert!(db.is_empty().await);
    }
}
