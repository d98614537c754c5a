use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use enrolld_domain::ModelGrade;
use enrolld_keystore::DeviceKey;
use serde::{Deserialize, Serialize};

use crate::canonical::canonical_bytes;
use crate::error::AssertError;

/// Media type used by the device service for assertion bodies.
pub const MEDIA_TYPE: &str = "application/x.ubuntu.assertion";

// ── Typed contents ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelContent {
    pub authority_id: String,
    pub brand_id: String,
    pub model: String,
    pub gadget: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Present on UC20-style models only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<ModelGrade>,
    #[serde(default)]
    pub snaps: Vec<String>,
    #[serde(default)]
    pub classic: bool,
    /// Account ids allowed to sign serials for this model, besides the brand.
    #[serde(default)]
    pub serial_authority: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ModelContent {
    /// Whether `authority` may sign serials for devices of this model.
    pub fn accepts_serial_authority(&self, authority: &str) -> bool {
        authority == self.brand_id || self.serial_authority.iter().any(|a| a == authority)
    }

    pub fn is_core20(&self) -> bool {
        self.grade.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SerialContent {
    pub authority_id: String,
    pub brand_id: String,
    pub model: String,
    pub serial: String,
    /// Base64 SubjectPublicKeyInfo DER of the device public key.
    pub device_key: String,
    pub device_key_fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SerialRequestContent {
    pub brand_id: String,
    pub model: String,
    pub request_id: String,
    /// Base64 SubjectPublicKeyInfo DER of the device public key.
    pub device_key: String,
    /// Proposed serial, when the gadget hook supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Free-form registration body from the gadget hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccountContent {
    pub authority_id: String,
    pub account_id: String,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccountKeyContent {
    pub authority_id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64 SubjectPublicKeyInfo DER.
    pub public_key: String,
    pub public_key_id: String,
    pub since: DateTime<Utc>,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AssertionContent {
    Model(ModelContent),
    Serial(SerialContent),
    SerialRequest(SerialRequestContent),
    Account(AccountContent),
    AccountKey(AccountKeyContent),
}

impl AssertionContent {
    pub fn kind(&self) -> &'static str {
        match self {
            AssertionContent::Model(_) => "model",
            AssertionContent::Serial(_) => "serial",
            AssertionContent::SerialRequest(_) => "serial-request",
            AssertionContent::Account(_) => "account",
            AssertionContent::AccountKey(_) => "account-key",
        }
    }
}

/// A signed, self-describing statement. The signature covers the canonical
/// JSON of the content plus `sign-key-id`; the `signature` field itself is
/// excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(flatten)]
    pub content: AssertionContent,
    #[serde(rename = "sign-key-id")]
    pub sign_key_id: String,
    /// Base64 PKCS#1 v1.5 SHA-256 signature.
    pub signature: String,
}

impl Assertion {
    /// Sign `content` with `key`, producing a complete assertion.
    pub fn sign(content: AssertionContent, key: &DeviceKey) -> Result<Assertion, AssertError> {
        let sign_key_id = key.key_id().as_str().to_string();
        let msg = signed_bytes(&content, &sign_key_id)?;
        let signature = B64.encode(key.sign(&msg));
        Ok(Assertion {
            content,
            sign_key_id,
            signature,
        })
    }

    /// Verify the signature against `public_der` (the signer's public key).
    pub fn verify(&self, public_der: &[u8]) -> Result<(), AssertError> {
        let msg = signed_bytes(&self.content, &self.sign_key_id)?;
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| AssertError::Signature)?;
        enrolld_keystore::verify(public_der, &msg, &sig).map_err(|_| AssertError::Signature)
    }

    pub fn kind(&self) -> &'static str {
        self.content.kind()
    }

    pub fn as_model(&self) -> Option<&ModelContent> {
        match &self.content {
            AssertionContent::Model(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&SerialContent> {
        match &self.content {
            AssertionContent::Serial(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_account_key(&self) -> Option<&AccountKeyContent> {
        match &self.content {
            AssertionContent::AccountKey(k) => Some(k),
            _ => None,
        }
    }

    /// Wire form: a single JSON document.
    pub fn encode(&self) -> Result<String, AssertError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Assertion, AssertError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn signed_bytes(content: &AssertionContent, sign_key_id: &str) -> Result<Vec<u8>, AssertError> {
    let mut v = serde_json::to_value(content)?;
    let map = v
        .as_object_mut()
        .ok_or_else(|| AssertError::Encode("assertion content is not an object".into()))?;
    map.insert(
        "sign-key-id".to_string(),
        serde_json::Value::String(sign_key_id.to_string()),
    );
    Ok(canonical_bytes(&v)?)
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Decode a stream of concatenated JSON assertion documents, in order.
pub fn decode_stream(text: &str) -> Result<Vec<Assertion>, AssertError> {
    let mut out = Vec::new();
    let stream = serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>();
    for doc in stream {
        let doc = doc.map_err(|e| AssertError::MalformedStream(e.to_string()))?;
        let assertion: Assertion = serde_json::from_value(doc)
            .map_err(|e| AssertError::MalformedStream(e.to_string()))?;
        out.push(assertion);
    }
    if out.is_empty() {
        return Err(AssertError::MalformedStream("empty assertion stream".into()));
    }
    Ok(out)
}

/// Encode a stream as concatenated JSON documents separated by blank lines.
pub fn encode_stream(assertions: &[Assertion]) -> Result<String, AssertError> {
    let docs: Result<Vec<String>, AssertError> =
        assertions.iter().map(|a| a.encode()).collect();
    Ok(docs?.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrolld_keystore::MIN_KEY_BITS;

    fn device_key() -> DeviceKey {
        DeviceKey::generate(MIN_KEY_BITS).unwrap()
    }

    fn serial_request(key: &DeviceKey) -> AssertionContent {
        AssertionContent::SerialRequest(SerialRequestContent {
            brand_id: "canonical".into(),
            model: "pc".into(),
            request_id: "R1".into(),
            device_key: B64.encode(key.public_der()),
            serial: None,
            body: None,
        })
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let key = device_key();
        let assertion = Assertion::sign(serial_request(&key), &key).unwrap();
        assertion.verify(key.public_der()).unwrap();
        assert_eq!(assertion.sign_key_id, key.key_id().as_str());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let key = device_key();
        let mut assertion = Assertion::sign(serial_request(&key), &key).unwrap();
        if let AssertionContent::SerialRequest(req) = &mut assertion.content {
            req.model = "other-model".into();
        }
        assert!(matches!(
            assertion.verify(key.public_der()).unwrap_err(),
            AssertError::Signature
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key = device_key();
        let other = device_key();
        let assertion = Assertion::sign(serial_request(&key), &key).unwrap();
        assert!(assertion.verify(other.public_der()).is_err());
    }

    #[test]
    fn encode_decode_preserves_type_tag() {
        let key = device_key();
        let assertion = Assertion::sign(serial_request(&key), &key).unwrap();
        let text = assertion.encode().unwrap();
        assert!(text.contains(r#""type":"serial-request""#));
        let back = Assertion::decode(&text).unwrap();
        assert_eq!(back, assertion);
        back.verify(key.public_der()).unwrap();
    }

    #[test]
    fn stream_round_trip_keeps_order() {
        let key = device_key();
        let a = Assertion::sign(serial_request(&key), &key).unwrap();
        let b = Assertion::sign(
            AssertionContent::Account(AccountContent {
                authority_id: "canonical".into(),
                account_id: "partner".into(),
                display_name: "Partner".into(),
                timestamp: Utc::now(),
            }),
            &key,
        )
        .unwrap();

        let text = encode_stream(&[a.clone(), b.clone()]).unwrap();
        let back = decode_stream(&text).unwrap();
        assert_eq!(back, vec![a, b]);
    }

    #[test]
    fn empty_stream_is_malformed() {
        assert!(matches!(
            decode_stream("  \n ").unwrap_err(),
            AssertError::MalformedStream(_)
        ));
    }

    #[test]
    fn garbage_stream_is_malformed() {
        assert!(matches!(
            decode_stream("{not json").unwrap_err(),
            AssertError::MalformedStream(_)
        ));
    }

    #[test]
    fn serial_authority_includes_brand() {
        let model = ModelContent {
            authority_id: "canonical".into(),
            brand_id: "canonical".into(),
            model: "pc".into(),
            gadget: "pc-gadget".into(),
            kernel: Some("pc-kernel".into()),
            base: Some("core20".into()),
            grade: Some(ModelGrade::Signed),
            snaps: vec![],
            classic: false,
            serial_authority: vec!["partner-vault".into()],
            timestamp: Utc::now(),
        };
        assert!(model.accepts_serial_authority("canonical"));
        assert!(model.accepts_serial_authority("partner-vault"));
        assert!(!model.accepts_serial_authority("mallory"));
        assert!(model.is_core20());
    }
}
