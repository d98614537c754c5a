use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use enrolld_domain::KeyId;
use tracing::{debug, warn};

use crate::error::KeystoreError;
use crate::key::DeviceKey;

/// Filesystem custody for device keys.
///
/// Keys are stored as PKCS#8 DER files named by their fingerprint, directly
/// under `root`. On UC20 the root is rebound from the device directory to
/// the save partition once that partition is mounted; `rebind` is atomic
/// with respect to concurrent `get`/`put` callers.
#[derive(Debug)]
pub struct KeypairStore {
    root: RwLock<PathBuf>,
}

impl KeypairStore {
    pub fn new(root: PathBuf) -> Self {
        KeypairStore {
            root: RwLock::new(root),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root.read().expect("keystore lock poisoned").clone()
    }

    /// Persist a key, returning its id. Overwrites an existing file with
    /// the same fingerprint (the content is identical by construction).
    pub fn put(&self, key: &DeviceKey) -> Result<KeyId, KeystoreError> {
        let root = self.root.read().expect("keystore lock poisoned");
        let der = key.to_der()?;
        write_key_file(&root, key.key_id(), &der)?;
        debug!(key_id = %key.key_id(), "stored device key");
        Ok(key.key_id().clone())
    }

    pub fn get(&self, id: &KeyId) -> Result<DeviceKey, KeystoreError> {
        let root = self.root.read().expect("keystore lock poisoned");
        let path = root.join(id.as_str());
        let der = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeystoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(KeystoreError::io(&path, e)),
        };
        DeviceKey::from_der(&der)
    }

    pub fn delete(&self, id: &KeyId) -> Result<(), KeystoreError> {
        let root = self.root.read().expect("keystore lock poisoned");
        let path = root.join(id.as_str());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeystoreError::NotFound(id.clone()))
            }
            Err(e) => Err(KeystoreError::io(&path, e)),
        }
    }

    /// Move custody to `new_root` (the UC20 save partition).
    ///
    /// Every key file is copied into the new root first; only when all
    /// copies have landed is the root pointer swapped, so a reader always
    /// sees a complete store. The originals are then removed best-effort.
    pub fn rebind(&self, new_root: PathBuf) -> Result<(), KeystoreError> {
        let mut root = self.root.write().expect("keystore lock poisoned");
        if *root == new_root {
            return Ok(());
        }

        fs::create_dir_all(&new_root).map_err(|e| KeystoreError::io(&new_root, e))?;

        let mut moved: Vec<PathBuf> = Vec::new();
        if root.is_dir() {
            let entries = fs::read_dir(&*root).map_err(|e| KeystoreError::io(&root, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| KeystoreError::io(&root, e))?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let der = fs::read(&path).map_err(|e| KeystoreError::io(&path, e))?;
                let id = KeyId::new(name.to_string_lossy().to_string());
                write_key_file(&new_root, &id, &der)?;
                moved.push(path);
            }
        }

        *root = new_root;
        drop(root);

        for old in moved {
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "could not remove relocated key file");
            }
        }
        Ok(())
    }
}

/// Temp-file + rename write so a crash never leaves a partial key on disk.
fn write_key_file(root: &Path, id: &KeyId, der: &[u8]) -> Result<(), KeystoreError> {
    fs::create_dir_all(root).map_err(|e| KeystoreError::io(root, e))?;
    let tmp = root.join(format!(".{}.tmp", id.as_str()));
    fs::write(&tmp, der).map_err(|e| KeystoreError::io(&tmp, e))?;
    let dest = root.join(id.as_str());
    fs::rename(&tmp, &dest).map_err(|e| KeystoreError::io(&dest, e))?;
    Ok(())
}
