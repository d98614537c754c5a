use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::InstallError;

// ── Raw YAML layer ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawGadget {
    #[serde(default)]
    volumes: BTreeMap<String, RawVolume>,
}

#[derive(Debug, Deserialize)]
struct RawVolume {
    bootloader: Option<String>,
    #[serde(default)]
    structure: Vec<RawStructure>,
}

#[derive(Debug, Deserialize)]
struct RawStructure {
    name: Option<String>,
    role: Option<String>,
    filesystem: Option<String>,
    size: Option<String>,
}

// ── Typed model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureRole {
    SystemSeed,
    SystemBoot,
    SystemData,
    SystemSave,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    pub name: String,
    pub role: Option<StructureRole>,
    pub filesystem: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub bootloader: Option<String>,
    pub structures: Vec<Structure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gadget {
    pub volumes: Vec<Volume>,
}

impl Gadget {
    /// An encrypted install needs a save partition to hold key material.
    pub fn has_system_save(&self) -> bool {
        self.volumes.iter().any(|v| {
            v.structures
                .iter()
                .any(|s| s.role == Some(StructureRole::SystemSave))
        })
    }
}

/// Load and convert `<gadget_dir>/gadget.yaml`.
pub fn load_gadget(gadget_dir: &Path) -> Result<Gadget, InstallError> {
    let path = gadget_dir.join("gadget.yaml");
    let content = fs::read_to_string(&path).map_err(|e| InstallError::io(&path, e))?;
    let raw: RawGadget = serde_yaml::from_str(&content)?;

    if raw.volumes.is_empty() {
        return Err(InstallError::Gadget("gadget declares no volumes".into()));
    }

    let volumes = raw
        .volumes
        .into_iter()
        .map(|(name, v)| convert_volume(name, v))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Gadget { volumes })
}

fn convert_volume(name: String, raw: RawVolume) -> Result<Volume, InstallError> {
    let structures = raw
        .structure
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let role = s.role.as_deref().map(parse_role);
            Ok(Structure {
                name: s.name.unwrap_or_else(|| format!("structure-{}", i)),
                role,
                filesystem: s.filesystem,
                size: s.size,
            })
        })
        .collect::<Result<Vec<_>, InstallError>>()?;
    Ok(Volume {
        name,
        bootloader: raw.bootloader,
        structures,
    })
}

fn parse_role(s: &str) -> StructureRole {
    match s {
        "system-seed" => StructureRole::SystemSeed,
        "system-boot" => StructureRole::SystemBoot,
        "system-data" => StructureRole::SystemData,
        "system-save" => StructureRole::SystemSave,
        other => StructureRole::Other(other.to_string()),
    }
}
