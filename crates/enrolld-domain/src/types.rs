use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Fingerprint of a device key: lowercase SHA-256 hex of the public key DER.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn new(s: impl Into<String>) -> Self {
        KeyId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Security grade declared by a model assertion. Absent grade means a
/// pre-grade (legacy) model; any grade at all marks the model as UC20-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelGrade {
    Dangerous,
    Signed,
    Secured,
}

impl ModelGrade {
    /// Secured models refuse to install without a TPM to seal against.
    pub fn requires_encryption(&self) -> bool {
        matches!(self, ModelGrade::Secured)
    }

    /// Whether the `.force-unencrypted` seed sentinel is honored.
    pub fn allows_force_unencrypted(&self) -> bool {
        matches!(self, ModelGrade::Dangerous | ModelGrade::Signed)
    }

    /// Whether cloud-init may be picked up from the seed partition at
    /// install time. Signed models only permit it when the gadget carries
    /// no cloud.conf of its own; Secured models never do.
    pub fn allows_seed_cloud_init(&self) -> bool {
        matches!(self, ModelGrade::Dangerous | ModelGrade::Signed)
    }
}

impl std::fmt::Display for ModelGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelGrade::Dangerous => write!(f, "dangerous"),
            ModelGrade::Signed => write!(f, "signed"),
            ModelGrade::Secured => write!(f, "secured"),
        }
    }
}

impl std::str::FromStr for ModelGrade {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dangerous" => Ok(ModelGrade::Dangerous),
            "signed" => Ok(ModelGrade::Signed),
            "secured" => Ok(ModelGrade::Secured),
            other => Err(crate::DomainError::InvalidGrade(other.to_string())),
        }
    }
}

/// Which system we are booted into, read from the mode environment at
/// startup. `Run` is the normal operational system; `Install` is the UC20
/// installer environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Run,
    Install,
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMode::Run => write!(f, "run"),
            SystemMode::Install => write!(f, "install"),
        }
    }
}

impl std::str::FromStr for SystemMode {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // An empty mode env means a legacy (non-UC20) run system.
            "" | "run" => Ok(SystemMode::Run),
            "install" => Ok(SystemMode::Install),
            other => Err(crate::DomainError::InvalidMode(other.to_string())),
        }
    }
}

/// Observed cloud-init lifecycle state, derived each tick from the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudInitState {
    /// Present but never triggered on this boot.
    Untriggered,
    /// Enabled and waiting to run.
    Enabled,
    /// Actively running right now.
    Running,
    /// Finished a successful run; datasource is known.
    Done,
    /// Finished in an error state.
    Errored,
    /// Disabled via cloud-init's own disable file.
    Disabled,
    /// Restricted by a datasource-pinning config fragment we wrote.
    Restricted,
    /// The cloud-init binary is not installed at all.
    NotFound,
}

impl std::fmt::Display for CloudInitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloudInitState::Untriggered => "untriggered",
            CloudInitState::Enabled => "enabled",
            CloudInitState::Running => "running",
            CloudInitState::Done => "done",
            CloudInitState::Errored => "errored",
            CloudInitState::Disabled => "disabled",
            CloudInitState::Restricted => "restricted",
            CloudInitState::NotFound => "not_found",
        };
        write!(f, "{}", s)
    }
}

// ── Core structs ──────────────────────────────────────────────────────────────

/// The durable identity of this device. Empty strings mean "not yet":
/// `key_id` is set once key generation completes, `serial` once a signed
/// serial assertion has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub key_id: String,
    /// Store session token obtained after registration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl DeviceIdentity {
    pub fn has_key(&self) -> bool {
        !self.key_id.is_empty()
    }

    pub fn registered(&self) -> bool {
        !self.serial.is_empty()
    }

    /// Clear everything except brand/model. Used by unregister.
    pub fn reset(&mut self) {
        self.serial.clear();
        self.key_id.clear();
        self.session_token = None;
    }
}
