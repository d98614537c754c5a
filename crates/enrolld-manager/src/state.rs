use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use enrolld_domain::DeviceIdentity;
use enrolld_engine::AttemptState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ManagerError;

/// Everything the manager persists across restarts, as one JSON file
/// under the device directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceState {
    #[serde(default)]
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub attempt: AttemptState,
    /// One-shot: initial software installation has completed.
    #[serde(default)]
    pub seeded: bool,
    /// Primary key of the acked model assertion, when one is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<(String, String)>,
}

pub fn load_state(path: &Path) -> Result<DeviceState, ManagerError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DeviceState::default());
        }
        Err(e) => return Err(ManagerError::io(path, e)),
    };
    serde_json::from_str(&text)
        .map_err(|e| ManagerError::Internal(format!("corrupt device state: {}", e)))
}

pub fn save_state(path: &Path, state: &DeviceState) -> Result<(), ManagerError> {
    let dir = path
        .parent()
        .ok_or_else(|| ManagerError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| ManagerError::io(dir, e))?;
    let text = serde_json::to_string_pretty(state)
        .map_err(|e| ManagerError::Internal(format!("encode device state: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).map_err(|e| ManagerError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ManagerError::io(path, e))?;
    Ok(())
}

// ── Changes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    BecomeOperational,
    InstallSystem,
    UpdateRevisions,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::BecomeOperational => write!(f, "become-operational"),
            ChangeKind::InstallSystem => write!(f, "install-system"),
            ChangeKind::UpdateRevisions => write!(f, "update-revisions"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Doing,
    Done,
    Error,
}

/// In-process record of a change driven by the manager. The real task
/// engine owns durable changes; this mirror enforces "at most one
/// become-operational in flight" and surfaces the error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub status: ChangeStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
}

impl Change {
    pub fn start(kind: ChangeKind, now: DateTime<Utc>) -> Self {
        Change {
            id: Uuid::new_v4(),
            kind,
            status: ChangeStatus::Doing,
            error: None,
            started_at: now,
            ready_at: None,
        }
    }

    pub fn done(&mut self, now: DateTime<Utc>) {
        self.status = ChangeStatus::Done;
        self.ready_at = Some(now);
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: String) {
        self.status = ChangeStatus::Error;
        self.error = Some(error);
        self.ready_at = Some(now);
    }

    pub fn in_flight(&self) -> bool {
        self.status == ChangeStatus::Doing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, DeviceState::default());
        assert!(!state.seeded);
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = DeviceState::default();
        state.seeded = true;
        state.identity.brand = "canonical".into();
        state.identity.serial = "9999".into();
        state.model = Some(("canonical".into(), "pc".into()));
        state.attempt.record_attempt(Utc::now());

        save_state(&path, &state).unwrap();
        let back = load_state(&path).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_state(&path).is_err());
    }

    #[test]
    fn change_lifecycle() {
        let now = Utc::now();
        let mut change = Change::start(ChangeKind::BecomeOperational, now);
        assert!(change.in_flight());

        change.fail(now, "cannot deliver device serial request: nope".into());
        assert!(!change.in_flight());
        assert_eq!(change.status, ChangeStatus::Error);
        assert!(change.error.as_ref().unwrap().contains("nope"));
    }
}
