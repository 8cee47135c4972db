//! Devices and Hardware IDs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::engine::error::{EngineError, Result};
use crate::engine::version::DriverVersion;

/// A PnP hardware identifier, e.g. `PCI\VEN_10DE&DEV_1C03&SUBSYS_11D810DE&REV_A1`.
///
/// All parts are stored upper-case. When used on a catalog entry the
/// optional sub-IDs act as wildcards (see [`HardwareId::covers`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareId {
    pub bus: String,
    pub vendor_id: String,
    pub device_id: String,
    pub subsys_id: Option<String>,
    pub revision: Option<String>,
}

impl HardwareId {
    pub fn parse(text: &str) -> Result<Self> {
        let normalized: String = text
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        let invalid = || EngineError::InvalidHardwareId(text.to_string());

        let (bus, rest) = normalized.split_once('\\').ok_or_else(invalid)?;
        if bus.is_empty() {
            return Err(invalid());
        }

        let mut vendor_id = None;
        let mut device_id = None;
        let mut subsys_id = None;
        let mut revision = None;

        for token in rest.split('&') {
            let Some((key, value)) = token.split_once('_') else {
                continue;
            };
            if value.is_empty() {
                return Err(invalid());
            }
            let slot = match key {
                "VEN" | "VID" => &mut vendor_id,
                "DEV" | "PID" => &mut device_id,
                "SUBSYS" => &mut subsys_id,
                "REV" => &mut revision,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }

        Ok(Self {
            bus: bus.to_string(),
            vendor_id: vendor_id.ok_or_else(invalid)?,
            device_id: device_id.ok_or_else(invalid)?,
            subsys_id,
            revision,
        })
    }

    /// Whether this ID, used as a catalog pattern, matches a device's ID.
    pub fn covers(&self, device: &HardwareId) -> bool {
        let optional_matches = |pattern: &Option<String>, actual: &Option<String>| match pattern {
            Some(p) => actual.as_deref() == Some(p.as_str()),
            None => true,
        };
        self.bus == device.bus
            && self.vendor_id == device.vendor_id
            && self.device_id == device.device_id
            && optional_matches(&self.subsys_id, &device.subsys_id)
            && optional_matches(&self.revision, &device.revision)
    }

    /// Match specificity of this pattern; more sub-IDs pinned ranks higher.
    pub fn specificity(&self) -> u32 {
        let mut score = 100 + 200;
        if self.subsys_id.is_some() {
            score += 50;
        }
        if self.revision.is_some() {
            score += 10;
        }
        score
    }

    /// `VEN_10DE&DEV_1C03` style short form, used in file and backup names.
    pub fn short_id(&self) -> String {
        format!("{}_{}", self.vendor_id, self.device_id)
    }

    fn uses_usb_keys(&self) -> bool {
        self.bus == "USB" || self.bus == "HID"
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ven, dev) = if self.uses_usb_keys() {
            ("VID", "PID")
        } else {
            ("VEN", "DEV")
        };
        write!(f, "{}\\{}_{}&{}_{}", self.bus, ven, self.vendor_id, dev, self.device_id)?;
        if let Some(subsys) = &self.subsys_id {
            write!(f, "&SUBSYS_{}", subsys)?;
        }
        if let Some(rev) = &self.revision {
            write!(f, "&REV_{}", rev)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for HardwareId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<HardwareId> for String {
    fn from(id: HardwareId) -> Self {
        id.to_string()
    }
}

/// Device class as reported by the hardware scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Display,
    Network,
    Audio,
    Storage,
    Usb,
    Bluetooth,
    Input,
    Chipset,
    #[serde(other)]
    Other,
}

/// One device from a hardware scan. Never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub hardware_id: HardwareId,
    pub class: DeviceClass,
    pub name: String,
    /// `None` when no driver is installed.
    #[serde(default)]
    pub installed_version: Option<DriverVersion>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub installed_on: Option<NaiveDate>,
    /// PnP instance path, used by the host to query the bound driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Published INF name of the bound driver (e.g. `oem42.inf`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inf_name: Option<String>,
}

impl DeviceRecord {
    pub fn new(hardware_id: HardwareId, class: DeviceClass, name: &str) -> Self {
        Self {
            hardware_id,
            class,
            name: name.to_string(),
            installed_version: None,
            provider: None,
            installed_on: None,
            instance_id: None,
            inf_name: None,
        }
    }

    pub fn with_driver(mut self, version: DriverVersion, provider: &str) -> Self {
        self.installed_version = Some(version);
        self.provider = Some(provider.to_string());
        self
    }
}

/// Load a hardware inventory snapshot written by the scan collaborator.
pub fn load_inventory(path: &Path) -> Result<Vec<DeviceRecord>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
