use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::RngCore;
use tracing::debug;

use crate::error::InstallError;

/// Options handed to the partitioning primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOpts {
    /// Mount the created filesystems under the target root.
    pub mount: bool,
    pub encrypt: bool,
}

/// Key material protecting the system-data partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKeySet {
    pub recovery_key: Vec<u8>,
    pub reinstall_key: Vec<u8>,
}

/// Key material protecting the system-save partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveKeySet {
    pub key: Vec<u8>,
}

/// What the partitioning primitive produced. Key sets are present exactly
/// when encryption was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionerOutput {
    pub data_keys: Option<DataKeySet>,
    pub save_keys: Option<SaveKeySet>,
}

/// The low-level partitioning/writing primitive. The real implementation
/// formats disks; this crate only consumes the contract.
#[async_trait]
pub trait Partitioner: Send + Sync + 'static {
    async fn create_partitions(
        &self,
        gadget_dir: &Path,
        opts: &PartitionOpts,
    ) -> Result<PartitionerOutput, InstallError>;
}

/// Inputs for configuring the freshly installed target system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureOpts {
    pub allow_cloud_init: bool,
    /// Seed directory to import cloud-init config from, when permitted.
    pub cloud_init_src_dir: Option<PathBuf>,
    pub target_root: PathBuf,
    pub gadget_dir: PathBuf,
}

#[async_trait]
pub trait SystemConfigurator: Send + Sync + 'static {
    async fn configure(&self, opts: &ConfigureOpts) -> Result<(), InstallError>;
}

/// Makes the target system bootable via the bootloader driver.
#[async_trait]
pub trait BootConfig: Send + Sync + 'static {
    /// `seal_keys` is set when an encrypted install needs the
    /// trusted-assets observer wired in.
    async fn make_bootable(
        &self,
        target_root: &Path,
        gadget_dir: &Path,
        seal_keys: bool,
    ) -> Result<(), InstallError>;
}

/// Requests a reboot into the installed system.
pub trait RestartRequester: Send + Sync + 'static {
    fn request_restart(&self);
}

// ── Local stub ────────────────────────────────────────────────────────────────

/// A stub partitioner that performs no disk I/O and fabricates key
/// material. Suitable for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct LocalPartitioner;

impl LocalPartitioner {
    pub fn new() -> Self {
        Self
    }

    fn random_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

#[async_trait]
impl Partitioner for LocalPartitioner {
    async fn create_partitions(
        &self,
        gadget_dir: &Path,
        opts: &PartitionOpts,
    ) -> Result<PartitionerOutput, InstallError> {
        debug!(gadget_dir = %gadget_dir.display(), ?opts, "LocalPartitioner: create_partitions");
        if !opts.encrypt {
            return Ok(PartitionerOutput::default());
        }
        Ok(PartitionerOutput {
            data_keys: Some(DataKeySet {
                recovery_key: Self::random_key(),
                reinstall_key: Self::random_key(),
            }),
            save_keys: Some(SaveKeySet {
                key: Self::random_key(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_partitioner_returns_keys_only_when_encrypting() {
        let p = LocalPartitioner::new();
        let dir = tempfile::tempdir().unwrap();

        let plain = p
            .create_partitions(dir.path(), &PartitionOpts { mount: true, encrypt: false })
            .await
            .unwrap();
        assert!(plain.data_keys.is_none());
        assert!(plain.save_keys.is_none());

        let enc = p
            .create_partitions(dir.path(), &PartitionOpts { mount: true, encrypt: true })
            .await
            .unwrap();
        let data = enc.data_keys.unwrap();
        assert_eq!(data.recovery_key.len(), 32);
        assert_ne!(data.recovery_key, data.reinstall_key);
        assert!(enc.save_keys.is_some());
    }
}
