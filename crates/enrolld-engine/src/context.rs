use std::collections::HashMap;

use async_trait::async_trait;
use enrolld_assert::{Assertion, ModelContent};
use enrolld_service::{resolve_endpoint, DeviceServiceClient, ServiceEndpoint};
use tracing::warn;

use crate::error::EngineError;

/// Typed output of the gadget's `prepare-device` hook. Only these keys are
/// honored; anything else the hook prints is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepareDeviceOutput {
    pub device_service_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub proposed_serial: Option<String>,
    pub body: Option<serde_json::Value>,
}

/// Runs gadget hooks. The real implementation shells out through the hook
/// pipeline; tests substitute a fake.
#[async_trait]
pub trait HookRunner: Send + Sync + 'static {
    /// Run `prepare-device` for `gadget`. `None` when the gadget has no
    /// such hook.
    async fn prepare_device(
        &self,
        gadget: &str,
    ) -> Result<Option<PrepareDeviceOutput>, EngineError>;
}

/// Hook runner for devices whose gadget has no hooks.
#[derive(Debug, Default, Clone)]
pub struct NoHooks;

#[async_trait]
impl HookRunner for NoHooks {
    async fn prepare_device(
        &self,
        _gadget: &str,
    ) -> Result<Option<PrepareDeviceOutput>, EngineError> {
        Ok(None)
    }
}

/// Registration-relevant slice of the device configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationConfig {
    pub device_service_url: Option<String>,
    pub device_service_headers: HashMap<String, String>,
    pub proposed_serial: Option<String>,
    pub body: Option<serde_json::Value>,
    pub proxy_store_url: Option<String>,
    /// `device-service.access=offline`: key generation only, no requests.
    pub offline: bool,
}

/// Everything one registration attempt needs, recomputed per attempt so
/// that gadget hook output and remodel state are always current.
#[derive(Debug, Clone)]
pub struct RegistrationContext {
    pub model: ModelContent,
    pub endpoint: ServiceEndpoint,
    pub extra_headers: HashMap<String, String>,
    pub proposed_serial: Option<String>,
    pub body: Option<serde_json::Value>,
    /// Assertions sent along with the serial request.
    pub ancillary: Vec<Assertion>,
    pub(crate) for_remodeling: bool,
}

impl RegistrationContext {
    pub fn for_remodeling(&self) -> bool {
        self.for_remodeling
    }
}

/// Build the per-attempt context: run the gadget hook, overlay its output
/// on the configuration, and resolve the effective service endpoint
/// through the store proxy when one is configured.
pub async fn compute_context(
    model: &ModelContent,
    config: &RegistrationConfig,
    hooks: &dyn HookRunner,
    client: &DeviceServiceClient,
    ancillary: Vec<Assertion>,
    for_remodeling: bool,
) -> Result<RegistrationContext, EngineError> {
    let hook_out = hooks.prepare_device(&model.gadget).await?.unwrap_or_default();

    let service_url = hook_out
        .device_service_url
        .or_else(|| config.device_service_url.clone());

    let mut extra_headers = config.device_service_headers.clone();
    extra_headers.extend(hook_out.headers);

    let proposed_serial = hook_out
        .proposed_serial
        .or_else(|| config.proposed_serial.clone());
    let body = hook_out.body.or_else(|| config.body.clone());

    // A proxy that cannot be reached is treated as absent: registration
    // should not wedge on an optional middlebox.
    let proxy = match &config.proxy_store_url {
        Some(url) => match client.discover_proxy(url).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(proxy = %url, error = %e, "store proxy unreachable, bypassing");
                None
            }
        },
        None => None,
    };

    let endpoint = resolve_endpoint(service_url.as_deref(), proxy.as_ref());

    Ok(RegistrationContext {
        model: model.clone(),
        endpoint,
        extra_headers,
        proposed_serial,
        body,
        ancillary,
        for_remodeling,
    })
}
