use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use enrolld_assert::{Assertion, FsAssertionDb};
use enrolld_domain::{Dirs, SystemMode};
use enrolld_engine::NoHooks;
use enrolld_firstboot::{
    AssumeOperational, BootOkReconciler, CloudInitRestrictor, EnvFileBootloader, HostCloudInit,
    RestrictionPolicy,
};
use enrolld_keystore::KeypairStore;
use enrolld_manager::{DeviceManager, ManagerOpts, UnregisterOpts, ENSURE_TICK};
use enrolld_service::{DeviceServiceClient, RetryPolicy};
use serde_json::json;
use tracing::{info, warn};

use crate::output;

fn system_mode() -> Result<SystemMode> {
    let raw = std::env::var("ENROLLD_SYSTEM_MODE").unwrap_or_default();
    raw.parse::<SystemMode>()
        .with_context(|| format!("unsupported system mode {:?}", raw))
}

async fn build_manager(
    root: &Path,
    gadget: String,
    classic: bool,
    allow_local_datasources: bool,
) -> Result<DeviceManager> {
    let mode = system_mode()?;
    if mode == SystemMode::Install {
        bail!("install mode is driven by the installer, not the run-mode daemon");
    }

    let dirs = Dirs::under(root);
    let keystore = Arc::new(KeypairStore::new(dirs.keypair_root()));
    let db = Arc::new(FsAssertionDb::new(dirs.assertions_dir()));
    let client = DeviceServiceClient::new(RetryPolicy::default())?;

    let host_cloud_init = || HostCloudInit {
        etc_cloud: root.join("etc/cloud"),
        status_json: root.join("run/cloud-init/status.json"),
    };
    let restrictor = CloudInitRestrictor::new(
        Box::new(host_cloud_init()),
        Box::new(host_cloud_init()),
        RestrictionPolicy {
            classic,
            allow_local_datasources,
        },
    );
    let bootok = BootOkReconciler::new(
        Arc::new(EnvFileBootloader::new(root.join("boot/grubenv"))),
        Arc::new(AssumeOperational),
    );

    let save_dir = root.join("run/mnt/ubuntu-save");
    let manager = DeviceManager::new(
        dirs,
        keystore,
        db,
        client,
        Arc::new(NoHooks),
        restrictor,
        bootok,
        None,
        ManagerOpts {
            classic,
            mode,
            gadget,
            ..Default::default()
        },
    )?;
    if save_dir.is_dir() {
        manager.rebind_save_partition(save_dir).await?;
    }
    Ok(manager)
}

pub async fn run(
    root: PathBuf,
    gadget: String,
    classic: bool,
    service_url: Option<String>,
    proxy_store: Option<String>,
    allow_local_datasources: bool,
) -> Result<()> {
    let manager = build_manager(&root, gadget.clone(), classic, allow_local_datasources).await?;

    let mut options = HashMap::new();
    if let Some(url) = service_url {
        options.insert(format!("{}.device-service.url", gadget), json!(url));
    }
    if let Some(proxy) = proxy_store {
        options.insert("core.proxy.store".to_string(), json!(proxy));
    }
    if !options.is_empty() {
        manager.set_config(&options).await?;
    }

    info!(root = %root.display(), "device manager running");
    let mut registered = manager.registered();
    loop {
        if let Err(e) = manager.ensure().await {
            warn!(error = %e, "ensure tick failed");
        }
        if registered.has_changed().unwrap_or(false) && *registered.borrow_and_update() {
            info!("device is registered and operational");
        }
        tokio::time::sleep(ENSURE_TICK).await;
    }
}

pub fn status(root: PathBuf, json: bool) -> Result<()> {
    let dirs = Dirs::under(&root);
    let state = enrolld_manager::state::load_state(&dirs.state_file())?;
    output::print_state(&state, json)
}

pub async fn unregister(
    root: PathBuf,
    gadget: String,
    classic: bool,
    no_register_until_reboot: bool,
) -> Result<()> {
    let manager = build_manager(&root, gadget, classic, false).await?;
    manager
        .unregister(UnregisterOpts {
            no_register_until_reboot,
        })
        .await?;
    println!("device unregistered");
    Ok(())
}

pub async fn mark_seeded(root: PathBuf, gadget: String, classic: bool) -> Result<()> {
    let manager = build_manager(&root, gadget, classic, false).await?;
    manager.mark_seeded().await?;
    println!("seeding recorded");
    Ok(())
}

pub async fn ack_model(
    root: PathBuf,
    gadget: String,
    classic: bool,
    assertion_path: PathBuf,
) -> Result<()> {
    let text = std::fs::read_to_string(&assertion_path)
        .with_context(|| format!("cannot read {}", assertion_path.display()))?;
    let assertion = Assertion::decode(&text)?;
    let model = assertion
        .as_model()
        .context("assertion is not a model assertion")?
        .clone();

    let manager = build_manager(&root, gadget, classic, false).await?;
    manager.ack_model(assertion).await?;
    println!("model set to {}/{}", model.brand_id, model.model);
    Ok(())
}
