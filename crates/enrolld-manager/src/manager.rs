use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use enrolld_assert::{Assertion, AssertionDb, ModelContent};
use enrolld_domain::{DeviceIdentity, Dirs, KeyId, SystemMode};
use enrolld_engine::{
    compute_context, AttemptState, BecomeOperational, HookRunner, TaskProgress,
};
use enrolld_firstboot::{BootOkReconciler, BootOutcome, CloudInitRestrictor};
use enrolld_install::InstallModeHandler;
use enrolld_keystore::{KeypairStore, KeystoreError, DEFAULT_KEY_BITS};
use enrolld_service::DeviceServiceClient;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{load_config, DeviceConfig};
use crate::error::ManagerError;
use crate::state::{load_state, save_state, Change, ChangeKind, DeviceState};

/// How often the task engine is expected to call `ensure`.
pub const ENSURE_TICK: Duration = enrolld_firstboot::RESTRICTOR_TICK;

/// Identity a classic host registers under when no model has been acked.
const CLASSIC_FALLBACK_BRAND: &str = "generic";
const CLASSIC_FALLBACK_MODEL: &str = "generic-classic";

fn classic_fallback_model() -> ModelContent {
    ModelContent {
        authority_id: CLASSIC_FALLBACK_BRAND.into(),
        brand_id: CLASSIC_FALLBACK_BRAND.into(),
        model: CLASSIC_FALLBACK_MODEL.into(),
        gadget: String::new(),
        kernel: None,
        base: None,
        grade: None,
        snaps: vec![],
        classic: true,
        serial_authority: vec![],
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOpts {
    pub classic: bool,
    pub mode: SystemMode,
    /// Gadget snap name, scoping configuration and hooks.
    pub gadget: String,
    /// Gadget content directory, needed in install mode.
    pub gadget_dir: Option<PathBuf>,
    pub key_bits: usize,
    pub poll_interval: Duration,
}

impl Default for ManagerOpts {
    fn default() -> Self {
        ManagerOpts {
            classic: false,
            mode: SystemMode::Run,
            gadget: String::new(),
            gadget_dir: None,
            key_bits: DEFAULT_KEY_BITS,
            poll_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnregisterOpts {
    /// Also write the `noregister` sentinel, suppressing re-registration
    /// until the next reboot.
    pub no_register_until_reboot: bool,
}

/// Snapshot for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub identity: DeviceIdentity,
    pub attempt: AttemptState,
    pub change: Option<Change>,
    /// Finished changes recorded this process (e.g. update-revisions).
    pub history: Vec<Change>,
    pub attempts_this_process: u64,
}

#[derive(Debug)]
struct Inner {
    dirs: Dirs,
    device: DeviceState,
    config: DeviceConfig,
    change: Option<Change>,
    history: Vec<Change>,
    retry_at: Option<DateTime<Utc>>,
    remodel: Option<ModelContent>,
    boot_ok_ran: bool,
    install_ran: bool,
    registered_emitted: bool,
    attempts: u64,
}

enum AttemptOutcome {
    Registered,
    Poll(Duration),
    /// Registration is suppressed; only the key was ensured.
    KeyOnly,
}

/// Owner of the device identity lifecycle. The task engine calls
/// [`DeviceManager::ensure`] on every tick; everything else hangs off
/// that. Shared state lives behind one coarse lock which is never held
/// across outbound HTTP or hook execution.
pub struct DeviceManager {
    opts: ManagerOpts,
    keystore: Arc<KeypairStore>,
    db: Arc<dyn AssertionDb>,
    client: DeviceServiceClient,
    hooks: Arc<dyn HookRunner>,
    engine: BecomeOperational,
    restrictor: std::sync::Mutex<CloudInitRestrictor>,
    bootok: BootOkReconciler,
    install: Option<Arc<InstallModeHandler>>,
    inner: Mutex<Inner>,
    registered_tx: watch::Sender<bool>,
}

impl DeviceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dirs: Dirs,
        keystore: Arc<KeypairStore>,
        db: Arc<dyn AssertionDb>,
        client: DeviceServiceClient,
        hooks: Arc<dyn HookRunner>,
        restrictor: CloudInitRestrictor,
        bootok: BootOkReconciler,
        install: Option<Arc<InstallModeHandler>>,
        opts: ManagerOpts,
    ) -> Result<Self, ManagerError> {
        let device = load_state(&dirs.state_file())?;
        let engine = BecomeOperational::new(
            keystore.clone(),
            db.clone(),
            client.clone(),
            opts.key_bits,
        )
        .with_poll_interval(opts.poll_interval);
        let (registered_tx, _) = watch::channel(false);

        Ok(DeviceManager {
            opts,
            keystore,
            db,
            client,
            hooks,
            engine,
            restrictor: std::sync::Mutex::new(restrictor),
            bootok,
            install,
            inner: Mutex::new(Inner {
                dirs,
                device,
                config: DeviceConfig::default(),
                change: None,
                history: Vec::new(),
                retry_at: None,
                remodel: None,
                boot_ok_ran: false,
                install_ran: false,
                registered_emitted: false,
                attempts: 0,
            }),
            registered_tx,
        })
    }

    /// One-shot notification channel; flips to `true` on successful
    /// registration.
    pub fn registered(&self) -> watch::Receiver<bool> {
        self.registered_tx.subscribe()
    }

    pub async fn status(&self) -> ManagerStatus {
        let inner = self.inner.lock().await;
        ManagerStatus {
            identity: inner.device.identity.clone(),
            attempt: inner.device.attempt.clone(),
            change: inner.change.clone(),
            history: inner.history.clone(),
            attempts_this_process: inner.attempts,
        }
    }

    /// Record that seeding completed; gates most registration logic.
    pub async fn mark_seeded(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        inner.device.seeded = true;
        save_state(&inner.dirs.state_file(), &inner.device)
    }

    /// Ack a model assertion as this device's model.
    pub async fn ack_model(&self, assertion: Assertion) -> Result<(), ManagerError> {
        let model = assertion
            .as_model()
            .cloned()
            .ok_or_else(|| ManagerError::Internal("ack_model on a non-model assertion".into()))?;
        self.db.add(&assertion).await?;
        let mut inner = self.inner.lock().await;
        inner.device.model = Some((model.brand_id.clone(), model.model.clone()));
        save_state(&inner.dirs.state_file(), &inner.device)
    }

    /// Begin a supervised transition to a new model. Suppresses any
    /// in-flight become-operational of the old model.
    pub async fn remodel(&self, assertion: Assertion) -> Result<(), ManagerError> {
        let model = assertion
            .as_model()
            .cloned()
            .ok_or_else(|| ManagerError::Internal("remodel on a non-model assertion".into()))?;
        self.db.add(&assertion).await?;
        let mut inner = self.inner.lock().await;
        info!(brand = %model.brand_id, model = %model.model, "starting remodel");
        inner.remodel = Some(model);
        if let Some(change) = inner.change.take() {
            if change.in_flight() {
                debug!(change = %change.id, "suppressing become-operational of the old model");
            }
        }
        inner.retry_at = None;
        inner.device.attempt.reset();
        save_state(&inner.dirs.state_file(), &inner.device)
    }

    /// Apply new configuration options.
    pub async fn set_config(&self, options: &HashMap<String, Value>) -> Result<(), ManagerError> {
        let config = load_config(options, &self.opts.gadget)?;
        let mut inner = self.inner.lock().await;
        inner.config = config;
        Ok(())
    }

    /// The UC20 save partition became available: move key custody there.
    pub async fn rebind_save_partition(&self, save_dir: PathBuf) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        inner.dirs.save_dir = Some(save_dir);
        let new_root = inner.dirs.keypair_root();
        self.keystore.rebind(new_root)?;
        Ok(())
    }

    /// Drop the device identity: delete the key, clear the identity and
    /// re-arm become-operational for the next tick.
    pub async fn unregister(&self, opts: UnregisterOpts) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let key_id = inner.device.identity.key_id.clone();
        if !key_id.is_empty() {
            match self.keystore.delete(&KeyId::new(key_id)) {
                Ok(()) | Err(KeystoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        inner.device.identity.reset();
        inner.device.attempt.reset();
        inner.change = None;
        inner.retry_at = None;
        inner.registered_emitted = false;
        let _ = self.registered_tx.send(false);

        if opts.no_register_until_reboot {
            let path = inner.dirs.noregister_file();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| ManagerError::io(dir, e))?;
            }
            std::fs::write(&path, b"").map_err(|e| ManagerError::io(&path, e))?;
            info!("registration suppressed until next reboot");
        }
        info!("device unregistered");
        save_state(&inner.dirs.state_file(), &inner.device)
    }

    /// The tick. Runs the per-boot reconcilers and, depending on mode,
    /// either install-system or become-operational.
    pub async fn ensure(&self) -> Result<(), ManagerError> {
        let now = Utc::now();
        match self.opts.mode {
            SystemMode::Install => self.ensure_install(now).await,
            SystemMode::Run => {
                let mut first_err: Option<ManagerError> = None;

                if let Err(e) = self.ensure_boot_ok(now).await {
                    warn!(error = %e, "boot-ok reconciliation failed");
                    first_err.get_or_insert(e);
                }
                if let Err(e) = self.ensure_cloud_init(now).await {
                    warn!(error = %e, "cloud-init restriction failed");
                    first_err.get_or_insert(e);
                }
                if let Err(e) = self.ensure_operational(now).await {
                    warn!(error = %e, "become-operational tick failed");
                    first_err.get_or_insert(e);
                }

                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    // ── Boot-ok ───────────────────────────────────────────────────────────────

    async fn ensure_boot_ok(&self, now: DateTime<Utc>) -> Result<(), ManagerError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.boot_ok_ran {
                return Ok(());
            }
            // Latch before running: a read error is fatal for this
            // process lifetime and must not be retried on later ticks.
            inner.boot_ok_ran = true;
        }

        let outcome = self.bootok.reconcile().await?;
        if let BootOutcome::RevertScheduled { ref stale } = outcome {
            let mut inner = self.inner.lock().await;
            let mut change = Change::start(ChangeKind::UpdateRevisions, now);
            change.done(now);
            inner.history.push(change);
            warn!(?stale, "requested update-revisions to re-converge boot state");
        }
        Ok(())
    }

    // ── Cloud-init ────────────────────────────────────────────────────────────

    async fn ensure_cloud_init(&self, now: DateTime<Utc>) -> Result<(), ManagerError> {
        let seeded = {
            let inner = self.inner.lock().await;
            inner.device.seeded
        };
        let outcome = {
            let mut restrictor = self
                .restrictor
                .lock()
                .expect("cloud-init restrictor lock poisoned");
            restrictor.ensure(now, seeded)?
        };
        if outcome.is_terminal() {
            debug!(?outcome, "cloud-init restriction settled");
        }
        Ok(())
    }

    // ── Install mode ──────────────────────────────────────────────────────────

    async fn ensure_install(&self, now: DateTime<Utc>) -> Result<(), ManagerError> {
        let handler = self
            .install
            .clone()
            .ok_or_else(|| ManagerError::Internal("install mode without an install handler".into()))?;
        let gadget_dir = self
            .opts
            .gadget_dir
            .clone()
            .ok_or_else(|| ManagerError::Internal("install mode without a gadget directory".into()))?;

        let model_key = {
            let mut inner = self.inner.lock().await;
            if inner.install_ran {
                return Ok(());
            }
            inner.install_ran = true;
            inner.change = Some(Change::start(ChangeKind::InstallSystem, now));
            inner.device.model.clone()
        };
        let model_key = match model_key {
            Some(k) => k,
            None => {
                return self
                    .fail_change(now, "install mode without an acked model".into())
                    .await;
            }
        };

        let model_assertion = match self.db.find_model(&model_key.0, &model_key.1).await? {
            Some(a) => a,
            None => {
                return self
                    .fail_change(now, "acked model missing from assertion database".into())
                    .await;
            }
        };

        let result = handler.install_system(&model_assertion, &gadget_dir).await;
        let mut inner = self.inner.lock().await;
        match result {
            Ok(()) => {
                if let Some(c) = inner.change.as_mut() {
                    c.done(Utc::now());
                }
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if let Some(c) = inner.change.as_mut() {
                    c.fail(Utc::now(), msg.clone());
                }
                warn!(error = %msg, "install-system failed");
                Ok(())
            }
        }
    }

    async fn fail_change(&self, now: DateTime<Utc>, msg: String) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.change.as_mut() {
            c.fail(now, msg.clone());
        }
        warn!(error = %msg, "change failed");
        Ok(())
    }

    // ── Become-operational ────────────────────────────────────────────────────

    async fn ensure_operational(&self, now: DateTime<Utc>) -> Result<(), ManagerError> {
        // Phase 1: gate and snapshot under the state lock.
        let (mut identity, model_key, config, remodel) = {
            let mut inner = self.inner.lock().await;
            if !inner.device.seeded {
                return Ok(());
            }
            let remodel = inner.remodel.clone();
            if inner.device.identity.registered() && remodel.is_none() {
                return Ok(());
            }
            if inner.dirs.noregister_file().exists() {
                debug!("noregister sentinel present, skipping registration");
                return Ok(());
            }
            if inner.config.registration_suppressed() && inner.device.identity.has_key() {
                return Ok(());
            }

            let continuing = inner.change.as_ref().map_or(false, |c| c.in_flight());
            if continuing {
                if let Some(at) = inner.retry_at {
                    if now < at {
                        return Ok(());
                    }
                }
            } else if !inner.device.attempt.can_attempt(now) {
                return Ok(());
            }

            let model_key = match &remodel {
                Some(m) => (m.brand_id.clone(), m.model.clone()),
                None => match &inner.device.model {
                    Some(k) => k.clone(),
                    // Classic hosts register under the generic fallback
                    // model; everything else needs an acked model first.
                    None if self.opts.classic => (
                        CLASSIC_FALLBACK_BRAND.to_string(),
                        CLASSIC_FALLBACK_MODEL.to_string(),
                    ),
                    None => {
                        debug!("no model acked yet, cannot register");
                        return Ok(());
                    }
                },
            };

            if !continuing {
                inner.device.attempt.record_attempt(now);
                inner.attempts += 1;
                inner.change = Some(Change::start(ChangeKind::BecomeOperational, now));
                save_state(&inner.dirs.state_file(), &inner.device)?;
            }
            inner.retry_at = None;

            (
                inner.device.identity.clone(),
                model_key,
                inner.config.clone(),
                remodel,
            )
        };

        // Phase 2: the actual work, without the lock.
        let result = self
            .run_attempt(&mut identity, &model_key, &config, remodel.as_ref())
            .await;

        // Phase 3: commit.
        let done_at = Utc::now();
        let mut inner = self.inner.lock().await;
        match result {
            Ok(AttemptOutcome::Registered) => {
                inner.device.identity = identity;
                inner.device.attempt.reset();
                if let Some(m) = remodel {
                    inner.device.model = Some((m.brand_id.clone(), m.model.clone()));
                    inner.remodel = None;
                }
                if let Some(c) = inner.change.as_mut() {
                    c.done(done_at);
                }
                save_state(&inner.dirs.state_file(), &inner.device)?;
                if !inner.registered_emitted {
                    inner.registered_emitted = true;
                    let _ = self.registered_tx.send(true);
                }
                Ok(())
            }
            Ok(AttemptOutcome::Poll(after)) => {
                inner.device.identity = identity;
                inner.retry_at = Some(
                    done_at
                        + chrono::Duration::from_std(after)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                );
                save_state(&inner.dirs.state_file(), &inner.device)?;
                Ok(())
            }
            Ok(AttemptOutcome::KeyOnly) => {
                inner.device.identity = identity;
                inner.device.attempt.reset();
                if let Some(c) = inner.change.as_mut() {
                    c.done(done_at);
                }
                debug!("registration suppressed by configuration, key ensured");
                save_state(&inner.dirs.state_file(), &inner.device)?;
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                // Key generation may have progressed before the failure.
                inner.device.identity = identity;
                if let Some(c) = inner.change.as_mut() {
                    c.fail(done_at, msg.clone());
                }
                save_state(&inner.dirs.state_file(), &inner.device)?;
                warn!(
                    error = %msg,
                    next_backoff_mins = inner.device.attempt.next_backoff_mins,
                    "become-operational failed"
                );
                Ok(())
            }
        }
    }

    async fn run_attempt(
        &self,
        identity: &mut DeviceIdentity,
        model_key: &(String, String),
        config: &DeviceConfig,
        remodel: Option<&ModelContent>,
    ) -> Result<AttemptOutcome, ManagerError> {
        let (model, ancillary) = match remodel {
            Some(m) => {
                // The service validating a remodel needs the new model.
                let assertion = self
                    .db
                    .find_model(&m.brand_id, &m.model)
                    .await?
                    .ok_or_else(|| {
                        ManagerError::Internal("remodel target missing from assertion database".into())
                    })?;
                (m.clone(), vec![assertion])
            }
            None => {
                let found = self
                    .db
                    .find_model(&model_key.0, &model_key.1)
                    .await?
                    .and_then(|a| a.as_model().cloned());
                let model = match found {
                    Some(m) => m,
                    // The fallback pair has no assertion in the database.
                    None if self.opts.classic && model_key.0 == CLASSIC_FALLBACK_BRAND => {
                        classic_fallback_model()
                    }
                    None => {
                        return Err(ManagerError::Internal(
                            "acked model missing from assertion database".into(),
                        ));
                    }
                };
                (model, vec![])
            }
        };

        self.engine.generate_device_key(identity).await?;

        if config.registration_suppressed() {
            return Ok(AttemptOutcome::KeyOnly);
        }

        let ctx = compute_context(
            &model,
            &config.registration(),
            self.hooks.as_ref(),
            &self.client,
            ancillary,
            remodel.is_some(),
        )
        .await?;

        match self.engine.request_serial(identity, &ctx).await? {
            TaskProgress::Done => Ok(AttemptOutcome::Registered),
            TaskProgress::Retry(after) => Ok(AttemptOutcome::Poll(after)),
        }
    }

    #[cfg(test)]
    pub(crate) async fn rewind_backoff(&self, by: chrono::Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(t) = inner.device.attempt.last_attempt_at {
            inner.device.attempt.last_attempt_at = Some(t - by);
        }
    }
}
