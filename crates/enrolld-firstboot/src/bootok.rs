use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::FirstbootError;

pub const SNAP_MODE: &str = "snap_mode";
pub const SNAP_CORE: &str = "snap_core";
pub const SNAP_TRY_CORE: &str = "snap_try_core";
pub const SNAP_KERNEL: &str = "snap_kernel";
pub const SNAP_TRY_KERNEL: &str = "snap_try_kernel";

const BOOT_VARS: &[&str] = &[
    SNAP_MODE,
    SNAP_CORE,
    SNAP_TRY_CORE,
    SNAP_KERNEL,
    SNAP_TRY_KERNEL,
];

/// Pluggable bootloader variable access.
#[async_trait]
pub trait Bootloader: Send + Sync + 'static {
    async fn get_vars(&self, names: &[&str]) -> Result<HashMap<String, String>, FirstbootError>;

    async fn set_vars(&self, vars: HashMap<String, String>) -> Result<(), FirstbootError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriedSnap {
    Base,
    Kernel,
}

impl std::fmt::Display for TriedSnap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriedSnap::Base => write!(f, "base"),
            TriedSnap::Kernel => write!(f, "kernel"),
        }
    }
}

/// Answers whether a tried snap revision is currently mounted and
/// functional on the running system.
pub trait TriedSnapCheck: Send + Sync + 'static {
    fn is_operational(&self, which: TriedSnap, revision: &str) -> bool;
}

/// Trusts that reaching this code at all means the tried snap booted.
/// Suitable when the snap mount pipeline has no richer health signal.
#[derive(Debug, Default, Clone)]
pub struct AssumeOperational;

impl TriedSnapCheck for AssumeOperational {
    fn is_operational(&self, _which: TriedSnap, _revision: &str) -> bool {
        true
    }
}

/// Verdict of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// Boot variables are consistent; nothing to do.
    InSync,
    /// A tried revision booted and works; it is now committed.
    Committed { tried: Vec<(TriedSnap, String)> },
    /// A try failed (or never marked itself); an update-revisions change
    /// must re-converge installed revisions.
    RevertScheduled { stale: Vec<(TriedSnap, String)> },
}

/// After a kernel or base has been "tried", decides whether the boot
/// succeeded and either commits the new revision or schedules a revert.
///
/// Runs at most once per process lifetime: the caller latches the result
/// and does not retry after a bootloader read error until restart.
pub struct BootOkReconciler {
    bootloader: Arc<dyn Bootloader>,
    check: Arc<dyn TriedSnapCheck>,
}

impl BootOkReconciler {
    pub fn new(bootloader: Arc<dyn Bootloader>, check: Arc<dyn TriedSnapCheck>) -> Self {
        BootOkReconciler { bootloader, check }
    }

    pub async fn reconcile(&self) -> Result<BootOutcome, FirstbootError> {
        let vars = self.bootloader.get_vars(BOOT_VARS).await?;
        let get = |name: &str| vars.get(name).map(|s| s.as_str()).unwrap_or("");

        let mode = get(SNAP_MODE);
        let tried: Vec<(TriedSnap, String)> = [
            (TriedSnap::Base, get(SNAP_CORE), get(SNAP_TRY_CORE)),
            (TriedSnap::Kernel, get(SNAP_KERNEL), get(SNAP_TRY_KERNEL)),
        ]
        .into_iter()
        .filter(|(_, current, try_)| !try_.is_empty() && try_ != current)
        .map(|(which, _, try_)| (which, try_.to_string()))
        .collect();

        match mode {
            "trying" if tried.is_empty() => {
                // Nothing actually differs; just leave try mode.
                self.bootloader
                    .set_vars(HashMap::from([(SNAP_MODE.to_string(), String::new())]))
                    .await?;
                Ok(BootOutcome::InSync)
            }
            "trying" => {
                let all_ok = tried
                    .iter()
                    .all(|(which, rev)| self.check.is_operational(*which, rev));
                if all_ok {
                    // Promote the tried revisions and leave try mode.
                    let mut update = HashMap::from([(SNAP_MODE.to_string(), String::new())]);
                    for (which, rev) in &tried {
                        let (var, try_var) = match which {
                            TriedSnap::Base => (SNAP_CORE, SNAP_TRY_CORE),
                            TriedSnap::Kernel => (SNAP_KERNEL, SNAP_TRY_KERNEL),
                        };
                        update.insert(var.to_string(), rev.clone());
                        update.insert(try_var.to_string(), String::new());
                    }
                    self.bootloader.set_vars(update).await?;
                    for (which, rev) in &tried {
                        info!(%which, revision = %rev, "committed tried snap revision");
                    }
                    Ok(BootOutcome::Committed { tried })
                } else {
                    // The try did not survive this boot; fall back.
                    let mut update = HashMap::from([
                        (SNAP_MODE.to_string(), String::new()),
                        (SNAP_TRY_CORE.to_string(), String::new()),
                        (SNAP_TRY_KERNEL.to_string(), String::new()),
                    ]);
                    update.retain(|k, _| k == SNAP_MODE || vars.contains_key(k.as_str()));
                    self.bootloader.set_vars(update).await?;
                    warn!("tried snap is not operational, scheduling revert");
                    Ok(BootOutcome::RevertScheduled { stale: tried })
                }
            }
            "" if !tried.is_empty() => {
                // Mode was cleared but a try variable still points at a
                // different revision: the tried snap failed to mark itself.
                let update: HashMap<String, String> = tried
                    .iter()
                    .map(|(which, _)| {
                        let try_var = match which {
                            TriedSnap::Base => SNAP_TRY_CORE,
                            TriedSnap::Kernel => SNAP_TRY_KERNEL,
                        };
                        (try_var.to_string(), String::new())
                    })
                    .collect();
                self.bootloader.set_vars(update).await?;
                warn!("stale snap try state found, scheduling update-revisions");
                Ok(BootOutcome::RevertScheduled { stale: tried })
            }
            _ => Ok(BootOutcome::InSync),
        }
    }
}

/// Bootloader variables held in a `key=value` environment file, the
/// format used by grub-editenv style bootloaders.
pub struct EnvFileBootloader {
    path: std::path::PathBuf,
}

impl EnvFileBootloader {
    pub fn new(path: std::path::PathBuf) -> Self {
        EnvFileBootloader { path }
    }

    fn read_all(&self) -> Result<HashMap<String, String>, FirstbootError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(FirstbootError::io(&self.path, e)),
        };
        Ok(text
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }
}

#[async_trait]
impl Bootloader for EnvFileBootloader {
    async fn get_vars(&self, names: &[&str]) -> Result<HashMap<String, String>, FirstbootError> {
        let all = self.read_all()?;
        Ok(names
            .iter()
            .filter_map(|n| all.get(*n).map(|v| (n.to_string(), v.clone())))
            .collect())
    }

    async fn set_vars(&self, update: HashMap<String, String>) -> Result<(), FirstbootError> {
        let mut all = self.read_all()?;
        all.extend(update);
        let mut keys: Vec<&String> = all.keys().collect();
        keys.sort();
        let text: String = keys
            .into_iter()
            .map(|k| format!("{}={}\n", k, all[k]))
            .collect();
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| FirstbootError::io(dir, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| FirstbootError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| FirstbootError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeBootloader {
        vars: Mutex<HashMap<String, String>>,
    }

    impl FakeBootloader {
        fn with(vars: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(FakeBootloader {
                vars: Mutex::new(
                    vars.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            })
        }

        fn get(&self, name: &str) -> String {
            self.vars.lock().unwrap().get(name).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Bootloader for FakeBootloader {
        async fn get_vars(
            &self,
            names: &[&str],
        ) -> Result<HashMap<String, String>, FirstbootError> {
            let vars = self.vars.lock().unwrap();
            Ok(names
                .iter()
                .filter_map(|n| vars.get(*n).map(|v| (n.to_string(), v.clone())))
                .collect())
        }

        async fn set_vars(&self, update: HashMap<String, String>) -> Result<(), FirstbootError> {
            self.vars.lock().unwrap().extend(update);
            Ok(())
        }
    }

    struct Operational(bool);

    impl TriedSnapCheck for Operational {
        fn is_operational(&self, _which: TriedSnap, _revision: &str) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn trying_and_operational_commits() {
        let bl = FakeBootloader::with(&[
            (SNAP_MODE, "trying"),
            (SNAP_KERNEL, "kernel_100.snap"),
            (SNAP_TRY_KERNEL, "kernel_101.snap"),
        ]);
        let r = BootOkReconciler::new(bl.clone(), Arc::new(Operational(true)));

        let outcome = r.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            BootOutcome::Committed {
                tried: vec![(TriedSnap::Kernel, "kernel_101.snap".into())]
            }
        );
        assert_eq!(bl.get(SNAP_MODE), "");
        assert_eq!(bl.get(SNAP_KERNEL), "kernel_101.snap");
        assert_eq!(bl.get(SNAP_TRY_KERNEL), "");
    }

    #[tokio::test]
    async fn trying_but_broken_schedules_revert() {
        let bl = FakeBootloader::with(&[
            (SNAP_MODE, "trying"),
            (SNAP_CORE, "core_50.snap"),
            (SNAP_TRY_CORE, "core_51.snap"),
        ]);
        let r = BootOkReconciler::new(bl.clone(), Arc::new(Operational(false)));

        let outcome = r.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            BootOutcome::RevertScheduled {
                stale: vec![(TriedSnap::Base, "core_51.snap".into())]
            }
        );
        assert_eq!(bl.get(SNAP_MODE), "");
        assert_eq!(bl.get(SNAP_CORE), "core_50.snap", "failed try must not be promoted");
        assert_eq!(bl.get(SNAP_TRY_CORE), "");
    }

    #[tokio::test]
    async fn cleared_mode_with_stale_try_var_schedules_reconverge() {
        let bl = FakeBootloader::with(&[
            (SNAP_MODE, ""),
            (SNAP_KERNEL, "kernel_100.snap"),
            (SNAP_TRY_KERNEL, "kernel_101.snap"),
        ]);
        let r = BootOkReconciler::new(bl.clone(), Arc::new(Operational(true)));

        let outcome = r.reconcile().await.unwrap();
        assert!(matches!(outcome, BootOutcome::RevertScheduled { .. }));
        assert_eq!(bl.get(SNAP_TRY_KERNEL), "");
    }

    #[tokio::test]
    async fn consistent_state_is_in_sync() {
        let bl = FakeBootloader::with(&[
            (SNAP_MODE, ""),
            (SNAP_KERNEL, "kernel_100.snap"),
            (SNAP_CORE, "core_50.snap"),
        ]);
        let r = BootOkReconciler::new(bl, Arc::new(Operational(true)));
        assert_eq!(r.reconcile().await.unwrap(), BootOutcome::InSync);
    }

    #[tokio::test]
    async fn try_mode_awaiting_reboot_is_in_sync() {
        // "try" means the bootloader has not yet booted the candidate;
        // nothing for us to judge.
        let bl = FakeBootloader::with(&[
            (SNAP_MODE, "try"),
            (SNAP_KERNEL, "kernel_100.snap"),
            (SNAP_TRY_KERNEL, "kernel_101.snap"),
        ]);
        let r = BootOkReconciler::new(bl, Arc::new(Operational(true)));
        assert_eq!(r.reconcile().await.unwrap(), BootOutcome::InSync);
    }

    struct FailingBootloader;

    #[async_trait]
    impl Bootloader for FailingBootloader {
        async fn get_vars(
            &self,
            _names: &[&str],
        ) -> Result<HashMap<String, String>, FirstbootError> {
            Err(FirstbootError::Bootloader("cannot read environment".into()))
        }

        async fn set_vars(&self, _vars: HashMap<String, String>) -> Result<(), FirstbootError> {
            unreachable!("set_vars must not be called after a read error")
        }
    }

    #[tokio::test]
    async fn read_error_surfaces() {
        let r = BootOkReconciler::new(Arc::new(FailingBootloader), Arc::new(Operational(true)));
        assert!(matches!(
            r.reconcile().await.unwrap_err(),
            FirstbootError::Bootloader(_)
        ));
    }

    #[tokio::test]
    async fn env_file_bootloader_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bl = EnvFileBootloader::new(dir.path().join("boot/env"));

        // Missing file reads as empty.
        assert!(bl.get_vars(&[SNAP_MODE]).await.unwrap().is_empty());

        bl.set_vars(HashMap::from([
            (SNAP_MODE.to_string(), "trying".to_string()),
            (SNAP_KERNEL.to_string(), "kernel_100.snap".to_string()),
        ]))
        .await
        .unwrap();
        bl.set_vars(HashMap::from([(
            SNAP_TRY_KERNEL.to_string(),
            "kernel_101.snap".to_string(),
        )]))
        .await
        .unwrap();

        let vars = bl
            .get_vars(&[SNAP_MODE, SNAP_KERNEL, SNAP_TRY_KERNEL])
            .await
            .unwrap();
        assert_eq!(vars[SNAP_MODE], "trying");
        assert_eq!(vars[SNAP_KERNEL], "kernel_100.snap");
        assert_eq!(vars[SNAP_TRY_KERNEL], "kernel_101.snap");
    }
}
