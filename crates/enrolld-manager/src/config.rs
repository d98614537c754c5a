use std::collections::HashMap;

use enrolld_engine::RegistrationConfig;
use serde_json::Value;

use crate::error::ManagerError;

/// Typed view of the recognized dotted configuration options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    /// `core.proxy.store`
    pub proxy_store: Option<String>,
    /// `core.store.access` == "offline"
    pub store_access_offline: bool,
    /// `<gadget>.device-service.url`
    pub device_service_url: Option<String>,
    /// `<gadget>.device-service.access` == "offline"
    pub device_service_offline: bool,
    /// `<gadget>.device-service.headers`
    pub device_service_headers: HashMap<String, String>,
    /// `<gadget>.registration.proposed-serial`
    pub proposed_serial: Option<String>,
    /// `<gadget>.registration.body` (a YAML map)
    pub registration_body: Option<Value>,
}

impl DeviceConfig {
    /// Whether serial requests are suppressed. Key generation still runs.
    /// `device-service.access=offline` only suppresses when no explicit
    /// service URL is configured; `core.store.access=offline` always does.
    pub fn registration_suppressed(&self) -> bool {
        self.store_access_offline
            || (self.device_service_offline && self.device_service_url.is_none())
    }

    pub fn registration(&self) -> RegistrationConfig {
        RegistrationConfig {
            device_service_url: self.device_service_url.clone(),
            device_service_headers: self.device_service_headers.clone(),
            proposed_serial: self.proposed_serial.clone(),
            body: self.registration_body.clone(),
            proxy_store_url: self.proxy_store.clone(),
            offline: self.registration_suppressed(),
        }
    }
}

/// Convert a map of dotted option names to the typed configuration.
/// Unknown keys are ignored; known keys with the wrong shape are errors
/// naming the key.
pub fn load_config(
    options: &HashMap<String, Value>,
    gadget: &str,
) -> Result<DeviceConfig, ManagerError> {
    let mut config = DeviceConfig::default();

    if let Some(v) = options.get("core.proxy.store") {
        config.proxy_store = Some(expect_string(v, "core.proxy.store")?).filter(|s| !s.is_empty());
    }
    if let Some(v) = options.get("core.store.access") {
        config.store_access_offline = expect_access(v, "core.store.access")?;
    }

    let key = |name: &str| format!("{}.{}", gadget, name);

    if let Some(v) = options.get(&key("device-service.url")) {
        config.device_service_url =
            Some(expect_string(v, "device-service.url")?).filter(|s| !s.is_empty());
    }
    if let Some(v) = options.get(&key("device-service.access")) {
        config.device_service_offline = expect_access(v, "device-service.access")?;
    }
    if let Some(v) = options.get(&key("device-service.headers")) {
        let map = v.as_object().ok_or_else(|| {
            ManagerError::Config("device-service.headers must be a map of strings".into())
        })?;
        for (k, v) in map {
            let v = expect_string(v, "device-service.headers")?;
            config.device_service_headers.insert(k.clone(), v);
        }
    }
    if let Some(v) = options.get(&key("registration.proposed-serial")) {
        config.proposed_serial =
            Some(expect_string(v, "registration.proposed-serial")?).filter(|s| !s.is_empty());
    }
    if let Some(v) = options.get(&key("registration.body")) {
        config.registration_body = Some(parse_body(v)?);
    }

    Ok(config)
}

fn expect_string(v: &Value, key: &str) -> Result<String, ManagerError> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ManagerError::Config(format!("{} must be a string", key)))
}

fn expect_access(v: &Value, key: &str) -> Result<bool, ManagerError> {
    match v.as_str() {
        Some("") => Ok(false),
        Some("offline") => Ok(true),
        _ => Err(ManagerError::Config(format!(
            "{} must be \"\" or \"offline\"",
            key
        ))),
    }
}

/// The registration body is a YAML map, arriving either pre-parsed or as
/// a YAML string.
fn parse_body(v: &Value) -> Result<Value, ManagerError> {
    let value = match v {
        Value::Object(_) => v.clone(),
        Value::String(s) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(s)
                .map_err(|e| ManagerError::Config(format!("registration.body: {}", e)))?;
            serde_json::to_value(yaml)
                .map_err(|e| ManagerError::Config(format!("registration.body: {}", e)))?
        }
        _ => {
            return Err(ManagerError::Config(
                "registration.body must be a map".into(),
            ))
        }
    };
    if !value.is_object() {
        return Err(ManagerError::Config(
            "registration.body must be a map".into(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn full_configuration_parses() {
        let opts = options(&[
            ("core.proxy.store", json!("https://proxy.internal")),
            ("core.store.access", json!("")),
            ("pc-gadget.device-service.url", json!("https://vault.example.com")),
            ("pc-gadget.device-service.access", json!("offline")),
            ("pc-gadget.device-service.headers", json!({"X-Extra": "1"})),
            ("pc-gadget.registration.proposed-serial", json!("serial-0001")),
            ("pc-gadget.registration.body", json!("mac: aa:bb:cc\nrev: 7\n")),
        ]);
        let config = load_config(&opts, "pc-gadget").unwrap();

        assert_eq!(config.proxy_store.as_deref(), Some("https://proxy.internal"));
        assert!(!config.store_access_offline);
        assert_eq!(
            config.device_service_url.as_deref(),
            Some("https://vault.example.com")
        );
        assert!(config.device_service_offline);
        assert_eq!(config.device_service_headers.get("X-Extra").unwrap(), "1");
        assert_eq!(config.proposed_serial.as_deref(), Some("serial-0001"));
        let body = config.registration_body.unwrap();
        assert_eq!(body["mac"], json!("aa:bb:cc"));
        assert_eq!(body["rev"], json!(7));
    }

    #[test]
    fn other_gadgets_options_are_ignored() {
        let opts = options(&[(
            "other-gadget.device-service.url",
            json!("https://elsewhere.example.com"),
        )]);
        let config = load_config(&opts, "pc-gadget").unwrap();
        assert!(config.device_service_url.is_none());
    }

    #[test]
    fn bad_access_value_is_an_error() {
        let opts = options(&[("core.store.access", json!("sometimes"))]);
        let err = load_config(&opts, "pc-gadget").unwrap_err();
        assert!(err.to_string().contains("core.store.access"));
    }

    #[test]
    fn body_must_be_a_map() {
        let opts = options(&[("pc-gadget.registration.body", json!("just a scalar"))]);
        assert!(load_config(&opts, "pc-gadget").is_err());

        let opts = options(&[("pc-gadget.registration.body", json!(["a", "b"]))]);
        assert!(load_config(&opts, "pc-gadget").is_err());
    }

    #[test]
    fn offline_gating_needs_no_url() {
        let mut config = DeviceConfig {
            device_service_offline: true,
            ..Default::default()
        };
        assert!(config.registration_suppressed());

        // An explicit URL overrides device-service offline access.
        config.device_service_url = Some("https://vault.example.com".into());
        assert!(!config.registration_suppressed());

        // But the store-wide switch always wins.
        config.store_access_offline = true;
        assert!(config.registration_suppressed());
    }
}
