use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the subdirectory holding DER-encoded device keys, under either
/// the device directory (legacy) or the save partition (UC20).
pub const PRIVATE_KEYS_DIR: &str = "private-keys-v1";

/// Sentinel under the run directory that suppresses registration until the
/// next reboot.
pub const NOREGISTER_FILE: &str = "noregister";

/// Sentinel on the seed partition that opts out of encryption on
/// non-Secured models.
pub const FORCE_UNENCRYPTED_FILE: &str = ".force-unencrypted";

/// Identity marker written both to the FDE data directory and the save
/// directory with identical contents.
pub const MARKER_FILE: &str = "marker";

/// Well-known filesystem layout for one device. UC20 systems additionally
/// carry a save partition; `save_dir` is `None` until it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirs {
    /// Persistent device directory: identity state, assertions, legacy keys.
    pub device_dir: PathBuf,
    /// Volatile run directory (cleared on reboot): `noregister` sentinel.
    pub run_dir: PathBuf,
    /// Seed partition mount point: `.force-unencrypted`, seed cloud-init data.
    pub seed_dir: PathBuf,
    /// FDE data directory: recovery/reinstall keys and the identity marker.
    pub fde_dir: PathBuf,
    /// UC20 save partition mount point, once available.
    pub save_dir: Option<PathBuf>,
}

impl Dirs {
    /// Layout rooted under a single directory. Production uses the real
    /// mount points; tests root everything under a tempdir.
    pub fn under(root: &Path) -> Self {
        Dirs {
            device_dir: root.join("var/lib/device"),
            run_dir: root.join("run/device"),
            seed_dir: root.join("run/mnt/ubuntu-seed"),
            fde_dir: root.join("var/lib/device/fde"),
            save_dir: None,
        }
    }

    /// Where device keys live right now: the save partition once mounted,
    /// the device directory otherwise.
    pub fn keypair_root(&self) -> PathBuf {
        match &self.save_dir {
            Some(save) => save.join(PRIVATE_KEYS_DIR),
            None => self.device_dir.join(PRIVATE_KEYS_DIR),
        }
    }

    pub fn assertions_dir(&self) -> PathBuf {
        self.device_dir.join("assertions")
    }

    pub fn state_file(&self) -> PathBuf {
        self.device_dir.join("state.json")
    }

    pub fn noregister_file(&self) -> PathBuf {
        self.run_dir.join(NOREGISTER_FILE)
    }

    pub fn force_unencrypted_file(&self) -> PathBuf {
        self.seed_dir.join(FORCE_UNENCRYPTED_FILE)
    }

    pub fn fde_marker_file(&self) -> PathBuf {
        self.fde_dir.join(MARKER_FILE)
    }

    pub fn save_marker_file(&self) -> Option<PathBuf> {
        self.save_dir.as_ref().map(|d| d.join(MARKER_FILE))
    }
}
