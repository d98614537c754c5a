use std::path::PathBuf;
use std::process::Command;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use enrolld_domain::CloudInitState;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::FirstbootError;

/// Tick frequency for the restrictor. The decision windows below are
/// wall-clock; the tick only bounds how late we notice them.
/// Must stay within 10s..=30s.
pub const RESTRICTOR_TICK: StdDuration = StdDuration::from_secs(20);

/// How long cloud-init may sit in an error state before we force-disable.
const ERROR_GRACE: i64 = 3 * 60;

/// How long cloud-init may stay non-terminal overall before we
/// force-disable.
const RUNNING_GRACE: i64 = 5 * 60;

// ── Collaborator contracts ────────────────────────────────────────────────────

/// Observes cloud-init's current state.
pub trait CloudInitProbe: Send + Sync + 'static {
    fn status(&self) -> Result<CloudInitState, FirstbootError>;

    /// Datasource of a completed run, e.g. "NoCloud" or "Ec2". Only
    /// meaningful when `status` returned `Done`.
    fn datasource(&self) -> Result<Option<String>, FirstbootError>;
}

/// Disables or restricts cloud-init on disk.
pub trait CloudInitCtl: Send + Sync + 'static {
    /// Whether a restriction config written by us is already present.
    fn already_restricted(&self) -> Result<bool, FirstbootError>;

    /// Whether cloud-init's own disable file is already present
    /// (manually placed or written by an earlier run).
    fn already_disabled(&self) -> Result<bool, FirstbootError>;

    fn disable(&self) -> Result<(), FirstbootError>;

    fn restrict(&self, datasource: &str) -> Result<(), FirstbootError>;
}

// ── Policy and outcomes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RestrictionPolicy {
    /// Classic (non-appliance) hosts are left entirely alone.
    pub classic: bool,
    /// Whether the model tolerates auto-imported local (NoCloud-style)
    /// datasources. When false, a Done run from a local datasource is
    /// disabled rather than restricted.
    pub allow_local_datasources: bool,
}

/// What one tick of the restrictor did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrictOutcome {
    /// Not seeded yet; try again later.
    Defer,
    /// Non-terminal cloud-init state inside a grace window.
    Reschedule,
    /// Terminal: nothing needed, now or ever.
    NoopForever,
    /// Terminal: cloud-init permanently disabled.
    Disabled,
    /// Terminal: cloud-init pinned to the named datasource.
    Restricted(String),
}

impl RestrictOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RestrictOutcome::NoopForever | RestrictOutcome::Disabled | RestrictOutcome::Restricted(_)
        )
    }
}

// ── The state machine ─────────────────────────────────────────────────────────

/// Drives cloud-init to a terminal restricted/disabled state before it can
/// be re-triggered. `ensure` is called once per tick with the current
/// wall-clock time; all windows are computed against that, never against
/// the tick frequency.
pub struct CloudInitRestrictor {
    probe: Box<dyn CloudInitProbe>,
    ctl: Box<dyn CloudInitCtl>,
    policy: RestrictionPolicy,

    terminal: Option<RestrictOutcome>,
    first_errored_at: Option<DateTime<Utc>>,
    first_active_at: Option<DateTime<Utc>>,
}

impl CloudInitRestrictor {
    pub fn new(
        probe: Box<dyn CloudInitProbe>,
        ctl: Box<dyn CloudInitCtl>,
        policy: RestrictionPolicy,
    ) -> Self {
        CloudInitRestrictor {
            probe,
            ctl,
            policy,
            terminal: None,
            first_errored_at: None,
            first_active_at: None,
        }
    }

    /// The terminal outcome, once one has been reached.
    pub fn terminal(&self) -> Option<&RestrictOutcome> {
        self.terminal.as_ref()
    }

    pub fn ensure(&mut self, now: DateTime<Utc>, seeded: bool) -> Result<RestrictOutcome, FirstbootError> {
        if let Some(t) = &self.terminal {
            return Ok(t.clone());
        }
        if self.policy.classic {
            return Ok(self.latch(RestrictOutcome::NoopForever));
        }
        if !seeded {
            return Ok(RestrictOutcome::Defer);
        }

        // Either marker ends the state machine; a manual disable is never
        // upgraded to a managed restriction.
        if self.ctl.already_restricted()? {
            info!("cloud-init is already restricted, nothing to do");
            return Ok(self.latch(RestrictOutcome::NoopForever));
        }
        if self.ctl.already_disabled()? {
            info!("cloud-init is already disabled, nothing to do");
            return Ok(self.latch(RestrictOutcome::NoopForever));
        }

        match self.probe.status()? {
            CloudInitState::NotFound => {
                self.ctl.disable()?;
                info!("cloud-init is not installed, disabling it permanently");
                Ok(self.latch(RestrictOutcome::Disabled))
            }
            CloudInitState::Disabled | CloudInitState::Untriggered => {
                self.ctl.disable()?;
                info!("cloud-init reported no user data, disabling it permanently");
                Ok(self.latch(RestrictOutcome::Disabled))
            }
            CloudInitState::Restricted => {
                info!("cloud-init is already restricted, nothing to do");
                Ok(self.latch(RestrictOutcome::NoopForever))
            }
            CloudInitState::Done => match self.probe.datasource()? {
                Some(ds) if self.policy.allow_local_datasources || !is_local_datasource(&ds) => {
                    self.ctl.restrict(&ds)?;
                    info!(datasource = %ds, "restricted cloud-init to its used datasource");
                    Ok(self.latch(RestrictOutcome::Restricted(ds)))
                }
                Some(ds) => {
                    self.ctl.disable()?;
                    info!(datasource = %ds, "cloud-init used a local datasource this model disallows, disabling it permanently");
                    Ok(self.latch(RestrictOutcome::Disabled))
                }
                None => {
                    self.ctl.disable()?;
                    info!("cloud-init finished without a recorded datasource, disabling it permanently");
                    Ok(self.latch(RestrictOutcome::Disabled))
                }
            },
            CloudInitState::Errored => {
                let first = *self.first_errored_at.get_or_insert_with(|| {
                    warn!(
                        "cloud-init is in an error state, will disable in {} minutes if it does not recover",
                        ERROR_GRACE / 60
                    );
                    now
                });
                if now - first >= Duration::seconds(ERROR_GRACE) {
                    self.ctl.disable()?;
                    warn!("cloud-init stayed in an error state, disabled it permanently");
                    Ok(self.latch(RestrictOutcome::Disabled))
                } else {
                    Ok(RestrictOutcome::Reschedule)
                }
            }
            CloudInitState::Running | CloudInitState::Enabled => {
                let first = *self.first_active_at.get_or_insert(now);
                if now - first >= Duration::seconds(RUNNING_GRACE) {
                    self.ctl.disable()?;
                    warn!("cloud-init never reached a final state, disabled it permanently");
                    Ok(self.latch(RestrictOutcome::Disabled))
                } else {
                    Ok(RestrictOutcome::Reschedule)
                }
            }
        }
    }

    fn latch(&mut self, outcome: RestrictOutcome) -> RestrictOutcome {
        self.terminal = Some(outcome.clone());
        outcome
    }
}

/// NoCloud-style datasources can be fed from removable media, which is
/// exactly what restriction is meant to prevent on stricter models.
fn is_local_datasource(ds: &str) -> bool {
    matches!(ds, "NoCloud" | "None")
}

// ── Host implementation ───────────────────────────────────────────────────────

/// Name of the restriction fragment; sorts after distribution config.
const RESTRICT_CFG: &str = "zzzz_restrict.cfg";

/// cloud-init's own kill switch.
const DISABLE_FILE: &str = "cloud-init.disabled";

#[derive(Serialize)]
struct RestrictFragment<'a> {
    datasource_list: [&'a str; 1],
}

/// Probe and actuator backed by the real host: the `cloud-init` binary,
/// its status JSON, and config under `/etc/cloud`.
pub struct HostCloudInit {
    pub etc_cloud: PathBuf,
    pub status_json: PathBuf,
}

impl HostCloudInit {
    pub fn new() -> Self {
        HostCloudInit {
            etc_cloud: PathBuf::from("/etc/cloud"),
            status_json: PathBuf::from("/run/cloud-init/status.json"),
        }
    }

    fn disable_file(&self) -> PathBuf {
        self.etc_cloud.join(DISABLE_FILE)
    }

    fn restrict_file(&self) -> PathBuf {
        self.etc_cloud.join("cloud.cfg.d").join(RESTRICT_CFG)
    }
}

impl Default for HostCloudInit {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudInitProbe for HostCloudInit {
    fn status(&self) -> Result<CloudInitState, FirstbootError> {
        if self.disable_file().exists() {
            return Ok(CloudInitState::Disabled);
        }
        let output = match Command::new("cloud-init").arg("status").output() {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CloudInitState::NotFound);
            }
            Err(e) => return Err(FirstbootError::Probe(e.to_string())),
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let status = stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("status:"))
            .map(|s| s.trim().to_string())
            .ok_or_else(|| FirstbootError::Probe(format!("unparsable status output: {:?}", stdout)))?;
        Ok(match status.as_str() {
            "running" => CloudInitState::Running,
            "done" => CloudInitState::Done,
            "error" => CloudInitState::Errored,
            "disabled" => CloudInitState::Disabled,
            "not run" => CloudInitState::Untriggered,
            other => return Err(FirstbootError::Probe(format!("unknown status {:?}", other))),
        })
    }

    fn datasource(&self) -> Result<Option<String>, FirstbootError> {
        let text = match std::fs::read_to_string(&self.status_json) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FirstbootError::io(&self.status_json, e)),
        };
        let v: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| FirstbootError::Probe(format!("status.json: {}", e)))?;
        // "DataSourceNoCloud [seed=/dev/sr0]" → "NoCloud"
        Ok(v["v1"]["datasource"].as_str().map(|raw| {
            let name = raw.split_whitespace().next().unwrap_or(raw);
            name.strip_prefix("DataSource").unwrap_or(name).to_string()
        }))
    }
}

impl CloudInitCtl for HostCloudInit {
    fn already_restricted(&self) -> Result<bool, FirstbootError> {
        Ok(self.restrict_file().exists())
    }

    fn already_disabled(&self) -> Result<bool, FirstbootError> {
        Ok(self.disable_file().exists())
    }

    fn disable(&self) -> Result<(), FirstbootError> {
        let path = self.disable_file();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| FirstbootError::io(dir, e))?;
        }
        std::fs::write(&path, b"").map_err(|e| FirstbootError::io(&path, e))
    }

    fn restrict(&self, datasource: &str) -> Result<(), FirstbootError> {
        let path = self.restrict_file();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| FirstbootError::io(dir, e))?;
        }
        let fragment = serde_yaml::to_string(&RestrictFragment {
            datasource_list: [datasource],
        })?;
        std::fs::write(&path, fragment).map_err(|e| FirstbootError::io(&path, e))
    }
}
