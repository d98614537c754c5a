use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use enrolld_assert::Assertion;
use enrolld_domain::{Dirs, ModelGrade};
use rand::RngCore;
use tracing::{info, warn};

use crate::encrypt::{decide_encryption, EncryptionDecision, TpmProbe};
use crate::error::InstallError;
use crate::gadget::load_gadget;
use crate::primitives::{
    BootConfig, ConfigureOpts, PartitionOpts, Partitioner, RestartRequester, SystemConfigurator,
};

const RECOVERY_KEY_FILE: &str = "recovery.key";
const REINSTALL_KEY_FILE: &str = "reinstall.key";
const SAVE_KEY_FILE: &str = "ubuntu-save.key";

/// Install-time orchestrator: validates the gadget, decides on
/// encryption, invokes the partitioning primitive and makes the new
/// system bootable. Only entered in install mode on a non-classic UC20
/// model.
pub struct InstallModeHandler {
    partitioner: Arc<dyn Partitioner>,
    configurator: Arc<dyn SystemConfigurator>,
    boot: Arc<dyn BootConfig>,
    tpm: Arc<dyn TpmProbe>,
    restart: Arc<dyn RestartRequester>,
    dirs: Dirs,
    target_root: PathBuf,
}

impl InstallModeHandler {
    pub fn new(
        partitioner: Arc<dyn Partitioner>,
        configurator: Arc<dyn SystemConfigurator>,
        boot: Arc<dyn BootConfig>,
        tpm: Arc<dyn TpmProbe>,
        restart: Arc<dyn RestartRequester>,
        dirs: Dirs,
        target_root: PathBuf,
    ) -> Self {
        InstallModeHandler {
            partitioner,
            configurator,
            boot,
            tpm,
            restart,
            dirs,
            target_root,
        }
    }

    /// Run the whole install sequence. A restart is requested only after
    /// every step has succeeded.
    pub async fn install_system(
        &self,
        model_assertion: &Assertion,
        gadget_dir: &Path,
    ) -> Result<(), InstallError> {
        let model = model_assertion
            .as_model()
            .ok_or_else(|| InstallError::Internal("install-system without a model".into()))?;
        if model.classic {
            return Err(InstallError::Fatal(
                "cannot install a classic model in install mode".into(),
            ));
        }
        let grade = model.grade.ok_or_else(|| {
            InstallError::Fatal("install mode requires a model with a grade".into())
        })?;
        info!(brand = %model.brand_id, model = %model.model, %grade, "installing system");

        let force_unencrypted = self.dirs.force_unencrypted_file().exists();
        let decision = decide_encryption(grade, self.tpm.as_ref(), force_unencrypted)?;
        let encrypt = decision == EncryptionDecision::Encrypt;

        let gadget = load_gadget(gadget_dir)?;
        if encrypt && !gadget.has_system_save() {
            return Err(InstallError::Gadget(
                "encrypted installation requires a system-save structure".into(),
            ));
        }

        let output = self
            .partitioner
            .create_partitions(gadget_dir, &PartitionOpts { mount: true, encrypt })
            .await?;

        if encrypt {
            if output.data_keys.is_none() {
                return Err(InstallError::Internal(
                    "partitioning returned no system-data keys".into(),
                ));
            }
            if output.save_keys.is_none() {
                return Err(InstallError::Internal(
                    "partitioning returned no system-save keys".into(),
                ));
            }
        }

        self.write_model(model_assertion)?;

        let cloud_init = cloud_init_opts(grade, &self.dirs.seed_dir, gadget_dir);
        self.configurator
            .configure(&ConfigureOpts {
                allow_cloud_init: cloud_init.0,
                cloud_init_src_dir: cloud_init.1,
                target_root: self.target_root.clone(),
                gadget_dir: gadget_dir.to_path_buf(),
            })
            .await?;

        self.boot
            .make_bootable(&self.target_root, gadget_dir, encrypt)
            .await?;

        if encrypt {
            let data = output.data_keys.as_ref().expect("checked above");
            let save = output.save_keys.as_ref().expect("checked above");
            self.persist_keys(&data.recovery_key, &data.reinstall_key, &save.key)?;
            self.write_markers()?;
        }

        info!("install complete, requesting restart into the new system");
        self.restart.request_restart();
        Ok(())
    }

    fn write_model(&self, model_assertion: &Assertion) -> Result<(), InstallError> {
        let path = self.dirs.device_dir.join("model");
        write_file(&path, model_assertion.encode()?.as_bytes())
    }

    fn persist_keys(
        &self,
        recovery: &[u8],
        reinstall: &[u8],
        save: &[u8],
    ) -> Result<(), InstallError> {
        write_file(&self.dirs.fde_dir.join(RECOVERY_KEY_FILE), recovery)?;
        write_file(&self.dirs.fde_dir.join(REINSTALL_KEY_FILE), reinstall)?;
        write_file(&self.dirs.fde_dir.join(SAVE_KEY_FILE), save)?;
        Ok(())
    }

    /// Identical marker content in the FDE data dir and the save dir, so
    /// a mismatched wipe of either partition is detectable at first boot.
    fn write_markers(&self) -> Result<(), InstallError> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let marker: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();

        write_file(&self.dirs.fde_marker_file(), marker.as_bytes())?;
        match self.dirs.save_marker_file() {
            Some(path) => write_file(&path, marker.as_bytes())?,
            None => warn!("no save directory mounted, wrote only the data marker"),
        }
        Ok(())
    }
}

/// Cloud-init policy at install time: `Dangerous` imports seed config,
/// `Signed` allows cloud-init only when the seed carries none, `Secured`
/// allows it only through the gadget's cloud.conf.
fn cloud_init_opts(
    grade: ModelGrade,
    seed_dir: &Path,
    gadget_dir: &Path,
) -> (bool, Option<PathBuf>) {
    let seed_ci = seed_dir.join("cloud-init");
    match grade {
        ModelGrade::Dangerous => {
            let src = seed_ci.is_dir().then_some(seed_ci);
            (true, src)
        }
        ModelGrade::Signed => (!seed_ci.is_dir(), None),
        ModelGrade::Secured => (gadget_dir.join("cloud.conf").is_file(), None),
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), InstallError> {
    let dir = path
        .parent()
        .ok_or_else(|| InstallError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| InstallError::io(dir, e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| InstallError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| InstallError::io(path, e))?;
    Ok(())
}
