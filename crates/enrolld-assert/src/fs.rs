use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::assertion::{Assertion, AssertionContent};
use crate::db::AssertionDb;
use crate::error::AssertError;

/// Filesystem-backed implementation of [`AssertionDb`].
///
/// Layout: `<root>/<kind>/<primary-key>.json`, one assertion per file,
/// written with the same temp-file + rename discipline as the keypair
/// store. This is the staging database under the device directory.
#[derive(Debug, Clone)]
pub struct FsAssertionDb {
    root: PathBuf,
}

impl FsAssertionDb {
    pub fn new(root: PathBuf) -> Self {
        FsAssertionDb { root }
    }

    fn path_for(&self, kind: &str, primary_key: &[&str]) -> PathBuf {
        let name: Vec<String> = primary_key.iter().map(|p| sanitize(p)).collect();
        self.root.join(kind).join(format!("{}.json", name.join(",")))
    }

    fn read_at(&self, path: &Path) -> Result<Option<Assertion>, AssertError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AssertError::io(path, e)),
        };
        Ok(Some(Assertion::decode(&text)?))
    }

    fn write_at(&self, path: &Path, assertion: &Assertion) -> Result<(), AssertError> {
        let dir = path.parent().expect("assertion path has a parent");
        fs::create_dir_all(dir).map_err(|e| AssertError::io(dir, e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, assertion.encode()?).map_err(|e| AssertError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| AssertError::io(path, e))?;
        Ok(())
    }
}

/// Primary keys appear in file names; keep them path-safe.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
        .collect()
}

#[async_trait]
impl AssertionDb for FsAssertionDb {
    async fn add(&self, assertion: &Assertion) -> Result<(), AssertError> {
        let path = match &assertion.content {
            AssertionContent::Serial(s) => {
                self.path_for("serial", &[&s.brand_id, &s.model, &s.serial])
            }
            AssertionContent::Model(m) => self.path_for("model", &[&m.brand_id, &m.model]),
            AssertionContent::Account(a) => self.path_for("account", &[&a.account_id]),
            AssertionContent::AccountKey(k) => {
                self.path_for("account-key", &[&k.public_key_id])
            }
            AssertionContent::SerialRequest(_) => {
                return Err(AssertError::Encode(
                    "serial-request assertions are not storable".into(),
                ));
            }
        };
        self.write_at(&path, assertion)?;
        debug!(kind = assertion.kind(), path = %path.display(), "stored assertion");
        Ok(())
    }

    async fn find_serial(
        &self,
        brand: &str,
        model: &str,
        serial: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        self.read_at(&self.path_for("serial", &[brand, model, serial]))
    }

    async fn find_model(
        &self,
        brand: &str,
        model: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        self.read_at(&self.path_for("model", &[brand, model]))
    }

    async fn find_account_key(
        &self,
        public_key_id: &str,
    ) -> Result<Option<Assertion>, AssertError> {
        self.read_at(&self.path_for("account-key", &[public_key_id]))
    }
}
