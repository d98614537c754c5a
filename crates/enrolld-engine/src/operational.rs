use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use enrolld_assert::{
    Assertion, AssertionContent, AssertionDb, SerialContent, SerialRequestContent,
};
use enrolld_domain::{DeviceIdentity, KeyId};
use enrolld_keystore::{DeviceKey, KeypairStore, KeystoreError};
use enrolld_service::{DeviceServiceClient, SerialOutcome};
use tracing::{debug, info};

use crate::context::RegistrationContext;
use crate::error::EngineError;

/// Outcome of one engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProgress {
    Done,
    /// Suspend and run the task again after the given interval.
    Retry(Duration),
}

/// The two-task become-operational engine: generate-device-key followed by
/// request-serial. Both tasks re-derive their progress from durable
/// artifacts (key in the store, assertion in the database, identity
/// fields), so a replay after any crash converges on the same identity.
pub struct BecomeOperational {
    keystore: Arc<KeypairStore>,
    db: Arc<dyn AssertionDb>,
    client: DeviceServiceClient,
    key_bits: usize,
    poll_interval: Duration,
}

impl BecomeOperational {
    pub fn new(
        keystore: Arc<KeypairStore>,
        db: Arc<dyn AssertionDb>,
        client: DeviceServiceClient,
        key_bits: usize,
    ) -> Self {
        BecomeOperational {
            keystore,
            db,
            client,
            key_bits,
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Task 1: ensure the device has a signing key.
    ///
    /// No-op when the identity already references a key that resolves in
    /// the store; a dangling reference (store wiped, identity kept) is
    /// healed by generating a fresh key.
    pub async fn generate_device_key(
        &self,
        identity: &mut DeviceIdentity,
    ) -> Result<(), EngineError> {
        if identity.has_key() {
            match self.keystore.get(&KeyId::new(identity.key_id.clone())) {
                Ok(_) => {
                    debug!(key_id = %identity.key_id, "device key already present");
                    return Ok(());
                }
                Err(KeystoreError::NotFound(_)) => {
                    debug!(key_id = %identity.key_id, "identity references a missing key, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let bits = self.key_bits;
        let key = tokio::task::spawn_blocking(move || DeviceKey::generate(bits))
            .await
            .map_err(|e| EngineError::Internal(format!("keygen task: {}", e)))??;
        let id = self.keystore.put(&key)?;
        identity.key_id = id.as_str().to_string();
        info!(key_id = %identity.key_id, bits, "generated device key");
        Ok(())
    }

    /// Task 2: obtain and commit a signed serial assertion.
    pub async fn request_serial(
        &self,
        identity: &mut DeviceIdentity,
        ctx: &RegistrationContext,
    ) -> Result<TaskProgress, EngineError> {
        // Replay of a completed change is a no-op.
        if identity.registered() && !ctx.for_remodeling() {
            return Ok(TaskProgress::Done);
        }
        if !identity.has_key() {
            return Err(EngineError::Internal(
                "request-serial ran before generate-device-key".into(),
            ));
        }
        let key = self.keystore.get(&KeyId::new(identity.key_id.clone()))?;

        // Crash point "after-add-serial": the assertion landed in the
        // database but the identity was never updated. Re-detect by the
        // proposed serial.
        if let Some(proposed) = &ctx.proposed_serial {
            if let Some(existing) = self
                .db
                .find_serial(&ctx.model.brand_id, &ctx.model.model, proposed)
                .await?
            {
                if let Some(s) = existing.as_serial() {
                    if s.device_key_fingerprint == key.key_id().as_str() {
                        debug!(serial = %proposed, "serial already in database, completing replay");
                        self.commit_identity(identity, ctx, s);
                        return Ok(TaskProgress::Done);
                    }
                }
            }
        }

        let request_id = self
            .client
            .fetch_request_id(&ctx.endpoint, &ctx.extra_headers)
            .await?;

        let content = SerialRequestContent {
            brand_id: ctx.model.brand_id.clone(),
            model: ctx.model.model.clone(),
            request_id,
            device_key: B64.encode(key.public_der()),
            serial: ctx.proposed_serial.clone(),
            body: ctx.body.clone(),
        };
        let request = Assertion::sign(AssertionContent::SerialRequest(content), &key)?;

        let outcome = self
            .client
            .submit_serial_request(&ctx.endpoint, &request, &ctx.extra_headers, &ctx.ancillary)
            .await?;

        match outcome {
            SerialOutcome::Poll => Ok(TaskProgress::Retry(self.poll_interval)),
            SerialOutcome::Rejected(msg) => Err(EngineError::Rejected(msg)),
            SerialOutcome::Signed(serial) => {
                self.accept_serial(identity, ctx, serial, Vec::new(), &key)
                    .await?;
                Ok(TaskProgress::Done)
            }
            SerialOutcome::Stream(mut all) => {
                let serial_count = all
                    .iter()
                    .filter(|a| matches!(a.content, AssertionContent::Serial(_)))
                    .count();
                if serial_count == 0 {
                    return Err(enrolld_assert::AssertError::MalformedStream(
                        "stream carries no serial assertion".into(),
                    )
                    .into());
                }
                if serial_count > 1 {
                    return Err(EngineError::DoubleSerial);
                }
                if !matches!(
                    all.last().map(|a| &a.content),
                    Some(AssertionContent::Serial(_))
                ) {
                    return Err(enrolld_assert::AssertError::MalformedStream(
                        "serial assertion must terminate the stream".into(),
                    )
                    .into());
                }
                let serial = all.pop().expect("stream is non-empty");
                self.accept_serial(identity, ctx, serial, all, &key).await?;
                Ok(TaskProgress::Done)
            }
        }
    }

    /// Validate a returned serial, store it (with its ancillary
    /// assertions) and commit the identity.
    async fn accept_serial(
        &self,
        identity: &mut DeviceIdentity,
        ctx: &RegistrationContext,
        serial: Assertion,
        ancillary: Vec<Assertion>,
        key: &DeviceKey,
    ) -> Result<(), EngineError> {
        let s = serial
            .as_serial()
            .ok_or_else(|| EngineError::Internal("accept_serial on a non-serial".into()))?
            .clone();

        if s.brand_id != ctx.model.brand_id || s.model != ctx.model.model {
            return Err(EngineError::Mismatch(format!(
                "expected {}/{}, got {}/{}",
                ctx.model.brand_id, ctx.model.model, s.brand_id, s.model
            )));
        }
        if s.device_key != B64.encode(key.public_der())
            || s.device_key_fingerprint != key.key_id().as_str()
        {
            return Err(EngineError::Mismatch(
                "serial is bound to a different device key".into(),
            ));
        }
        if !ctx.model.accepts_serial_authority(&s.authority_id) {
            return Err(EngineError::Mismatch(format!(
                "authority {} may not sign serials for this model",
                s.authority_id
            )));
        }

        // Ancillary material first, so the serial's signing key resolves.
        for a in &ancillary {
            match &a.content {
                AssertionContent::Account(_) | AssertionContent::AccountKey(_) => {
                    self.db.add(a).await?;
                }
                other => {
                    return Err(enrolld_assert::AssertError::MalformedStream(format!(
                        "unexpected {} assertion in serial stream",
                        match other {
                            AssertionContent::Serial(_) => "serial",
                            AssertionContent::Model(_) => "model",
                            AssertionContent::SerialRequest(_) => "serial-request",
                            _ => "unknown",
                        }
                    ))
                    .into());
                }
            }
        }

        let signer = self
            .db
            .find_account_key(&serial.sign_key_id)
            .await?
            .ok_or_else(|| {
                enrolld_assert::AssertError::NotFound(format!(
                    "account-key {} of serial authority",
                    serial.sign_key_id
                ))
            })?;
        let signer = signer
            .as_account_key()
            .ok_or_else(|| EngineError::Internal("account-key lookup returned another kind".into()))?
            .clone();
        if signer.account_id != s.authority_id {
            return Err(EngineError::Mismatch(format!(
                "serial signed with a key of account {}, not authority {}",
                signer.account_id, s.authority_id
            )));
        }
        let signer_der = B64
            .decode(&signer.public_key)
            .map_err(|_| enrolld_assert::AssertError::Signature)?;
        serial.verify(&signer_der)?;

        self.db.add(&serial).await?;
        self.commit_identity(identity, ctx, &s);
        info!(brand = %s.brand_id, model = %s.model, serial = %s.serial, "device registered");
        Ok(())
    }

    fn commit_identity(
        &self,
        identity: &mut DeviceIdentity,
        ctx: &RegistrationContext,
        s: &SerialContent,
    ) {
        identity.brand = ctx.model.brand_id.clone();
        identity.model = ctx.model.model.clone();
        identity.serial = s.serial.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use enrolld_assert::{AccountKeyContent, MemoryAssertionDb, ModelContent, MEDIA_TYPE};
    use enrolld_keystore::MIN_KEY_BITS;
    use enrolld_service::{RetryPolicy, ServiceEndpoint};
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: tempfile::TempDir,
        keystore: Arc<KeypairStore>,
        db: Arc<MemoryAssertionDb>,
        engine: BecomeOperational,
        brand_key: DeviceKey,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(KeypairStore::new(dir.path().join("private-keys-v1")));
        let db = Arc::new(MemoryAssertionDb::new());
        let client = DeviceServiceClient::new(RetryPolicy::immediate(3)).unwrap();
        let engine = BecomeOperational::new(
            keystore.clone(),
            db.clone(),
            client,
            MIN_KEY_BITS,
        )
        .with_poll_interval(Duration::from_millis(1));

        // The brand's account-key is pre-trusted in the database.
        let brand_key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        db.add(&account_key_for("canonical", &brand_key)).await.unwrap();

        Fixture {
            _dir: dir,
            keystore,
            db,
            engine,
            brand_key,
        }
    }

    fn account_key_for(account: &str, key: &DeviceKey) -> Assertion {
        Assertion::sign(
            AssertionContent::AccountKey(AccountKeyContent {
                authority_id: "canonical".into(),
                account_id: account.into(),
                name: None,
                public_key: B64.encode(key.public_der()),
                public_key_id: key.key_id().as_str().into(),
                since: Utc::now(),
            }),
            key,
        )
        .unwrap()
    }

    fn model() -> ModelContent {
        ModelContent {
            authority_id: "canonical".into(),
            brand_id: "canonical".into(),
            model: "pc".into(),
            gadget: "pc-gadget".into(),
            kernel: Some("pc-kernel".into()),
            base: Some("core20".into()),
            grade: None,
            snaps: vec![],
            classic: false,
            serial_authority: vec![],
            timestamp: Utc::now(),
        }
    }

    fn ctx_for(server_url: &str, model: ModelContent) -> RegistrationContext {
        RegistrationContext {
            model,
            endpoint: ServiceEndpoint {
                base_url: server_url.to_string(),
                headers: HashMap::new(),
            },
            extra_headers: HashMap::new(),
            proposed_serial: None,
            body: None,
            ancillary: vec![],
            for_remodeling: false,
        }
    }

    fn signed_serial(
        signer: &DeviceKey,
        authority: &str,
        device: &DeviceKey,
        serial: &str,
    ) -> Assertion {
        Assertion::sign(
            AssertionContent::Serial(SerialContent {
                authority_id: authority.into(),
                brand_id: "canonical".into(),
                model: "pc".into(),
                serial: serial.into(),
                device_key: B64.encode(device.public_der()),
                device_key_fingerprint: device.key_id().as_str().into(),
                timestamp: Utc::now(),
            }),
            signer,
        )
        .unwrap()
    }

    async fn mount_request_id(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/request-id"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"request-id": "R1"})),
            )
            .mount(server)
            .await;
    }

    fn assertion_response(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body, MEDIA_TYPE)
    }

    #[tokio::test]
    async fn generate_device_key_is_idempotent() {
        let fx = fixture().await;
        let mut identity = DeviceIdentity::default();

        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let first = identity.key_id.clone();
        assert!(!first.is_empty());

        fx.engine.generate_device_key(&mut identity).await.unwrap();
        assert_eq!(identity.key_id, first, "second run must be a no-op");
        assert!(fx.keystore.get(&KeyId::new(first)).is_ok());
    }

    #[tokio::test]
    async fn happy_path_registers_device() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        mount_request_id(&server).await;
        let serial = signed_serial(&fx.brand_key, "canonical", &device_key, "9999");
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(assertion_response(serial.encode().unwrap()))
            .mount(&server)
            .await;

        let progress = fx
            .engine
            .request_serial(&mut identity, &ctx_for(&server.uri(), model()))
            .await
            .unwrap();
        assert_eq!(progress, TaskProgress::Done);
        assert_eq!(identity.serial, "9999");
        assert_eq!(identity.brand, "canonical");
        assert!(fx
            .db
            .find_serial("canonical", "pc", "9999")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn poll_suspends_then_completes() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        mount_request_id(&server).await;
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        let serial = signed_serial(&fx.brand_key, "canonical", &device_key, "10002");
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(assertion_response(serial.encode().unwrap()))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server.uri(), model());
        let mut polls = 0;
        loop {
            match fx.engine.request_serial(&mut identity, &ctx).await.unwrap() {
                TaskProgress::Retry(_) => polls += 1,
                TaskProgress::Done => break,
            }
        }
        assert_eq!(polls, 2);
        assert_eq!(identity.serial, "10002");
    }

    #[tokio::test]
    async fn rejection_carries_service_message() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();

        mount_request_id(&server).await;
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error_list": [{"message": "bad serial-request"}]
            })))
            .mount(&server)
            .await;

        let err = fx
            .engine
            .request_serial(&mut identity, &ctx_for(&server.uri(), model()))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot deliver device serial request: bad serial-request"
        );
        assert!(!identity.registered());
    }

    #[tokio::test]
    async fn stream_with_two_serials_is_fatal() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        let authority_key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let stream = enrolld_assert::encode_stream(&[
            account_key_for("partner-vault", &authority_key),
            signed_serial(&authority_key, "partner-vault", &device_key, "1"),
            signed_serial(&authority_key, "partner-vault", &device_key, "2"),
        ])
        .unwrap();

        mount_request_id(&server).await;
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(assertion_response(stream))
            .mount(&server)
            .await;

        let mut m = model();
        m.serial_authority = vec!["partner-vault".into()];
        let err = fx
            .engine
            .request_serial(&mut identity, &ctx_for(&server.uri(), m))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot accept more than a single device serial assertion"));
        assert!(!identity.registered());
    }

    #[tokio::test]
    async fn stream_from_separate_authority_registers() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        let authority_key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let stream = enrolld_assert::encode_stream(&[
            account_key_for("partner-vault", &authority_key),
            signed_serial(&authority_key, "partner-vault", &device_key, "77"),
        ])
        .unwrap();

        mount_request_id(&server).await;
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(assertion_response(stream))
            .mount(&server)
            .await;

        let mut m = model();
        m.serial_authority = vec!["partner-vault".into()];
        let progress = fx
            .engine
            .request_serial(&mut identity, &ctx_for(&server.uri(), m))
            .await
            .unwrap();
        assert_eq!(progress, TaskProgress::Done);
        assert_eq!(identity.serial, "77");
    }

    #[tokio::test]
    async fn disallowed_authority_is_a_mismatch() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        let mallory_key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let stream = enrolld_assert::encode_stream(&[
            account_key_for("mallory", &mallory_key),
            signed_serial(&mallory_key, "mallory", &device_key, "666"),
        ])
        .unwrap();

        mount_request_id(&server).await;
        Mock::given(method("POST"))
            .and(path("/serial"))
            .respond_with(assertion_response(stream))
            .mount(&server)
            .await;

        let err = fx
            .engine
            .request_serial(&mut identity, &ctx_for(&server.uri(), model()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Mismatch(_)));
        assert!(!identity.registered());
    }

    #[tokio::test]
    async fn replay_after_db_add_needs_no_network() {
        let fx = fixture().await;
        let mut identity = DeviceIdentity::default();
        fx.engine.generate_device_key(&mut identity).await.unwrap();
        let device_key = fx
            .keystore
            .get(&KeyId::new(identity.key_id.clone()))
            .unwrap();

        // The serial made it into the database before a crash; the
        // identity was never updated.
        let serial = signed_serial(&fx.brand_key, "canonical", &device_key, "4242");
        fx.db.add(&serial).await.unwrap();

        // No server is listening here; completing must not touch it.
        let mut ctx = ctx_for("http://127.0.0.1:9", model());
        ctx.proposed_serial = Some("4242".into());

        let progress = fx.engine.request_serial(&mut identity, &ctx).await.unwrap();
        assert_eq!(progress, TaskProgress::Done);
        assert_eq!(identity.serial, "4242");
    }

    #[tokio::test]
    async fn completed_change_replays_as_no_op() {
        let fx = fixture().await;
        let mut identity = DeviceIdentity {
            brand: "canonical".into(),
            model: "pc".into(),
            serial: "9999".into(),
            key_id: "some-key".into(),
            session_token: None,
        };
        let before = identity.clone();
        let progress = fx
            .engine
            .request_serial(&mut identity, &ctx_for("http://127.0.0.1:9", model()))
            .await
            .unwrap();
        assert_eq!(progress, TaskProgress::Done);
        assert_eq!(identity, before);
    }
}
