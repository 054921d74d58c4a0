//! Per-instance simulator configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ModemError, Result};
use crate::peer::{LocalSocketConnector, PeerConnector};

pub const DEFAULT_HOST_PORT: u16 = 6520;
pub const TIMEZONE_FILE: &str = "/etc/timezone";

/// Which ICC profile an instance boots with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimType {
    Normal,
    /// Carrier-API test profile used by CTS
    CarrierTest,
}

impl TryFrom<u8> for SimType {
    type Error = ModemError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SimType::Normal),
            2 => Ok(SimType::CarrierTest),
            other => Err(ModemError::InvalidConfig(format!(
                "unsupported sim type {}",
                other
            ))),
        }
    }
}

/// Guest network parameters handed out through PDP contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub ril_address: String,
    pub ril_prefixlen: u8,
    pub ril_gateway: String,
    pub ril_dns: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ril_address: "10.0.2.15".to_string(),
            ril_prefixlen: 24,
            ril_gateway: "10.0.2.2".to_string(),
            ril_dns: vec!["8.8.8.8".to_string()],
        }
    }
}

impl DeviceConfig {
    /// Dotted netmask for `ril_prefixlen`
    pub fn netmask(&self) -> String {
        let bits = u32::from(self.ril_prefixlen.min(32));
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        let octets = mask.to_be_bytes();
        format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
    }
}

#[derive(Clone)]
pub struct SimulatorConfig {
    pub instance_id: usize,
    pub host_port: u16,
    pub instance_dir: PathBuf,
    pub sim_type: SimType,
    pub device: DeviceConfig,
    /// Zone name with `/` replaced by `!`, as carried in `%CTZV`
    pub timezone: Option<String>,
    pub connector: Arc<dyn PeerConnector>,
}

impl SimulatorConfig {
    pub fn new(instance_id: usize, instance_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_id,
            host_port: DEFAULT_HOST_PORT,
            instance_dir: instance_dir.into(),
            sim_type: SimType::Normal,
            device: DeviceConfig::default(),
            timezone: None,
            connector: Arc::new(LocalSocketConnector),
        }
    }

    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = port;
        self
    }

    pub fn with_sim_type(mut self, sim_type: SimType) -> Self {
        self.sim_type = sim_type;
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_timezone(mut self, timezone: Option<String>) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Location of this instance's ICC document
    pub fn icc_profile_path(&self) -> PathBuf {
        self.instance_dir
            .join(format!("iccprofile_for_sim{}.xml", self.instance_id))
    }
}

impl std::fmt::Debug for SimulatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorConfig")
            .field("instance_id", &self.instance_id)
            .field("host_port", &self.host_port)
            .field("instance_dir", &self.instance_dir)
            .field("sim_type", &self.sim_type)
            .field("device", &self.device)
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}

/// Read the zone name from a Debian-style timezone file
pub fn load_timezone(path: &Path) -> Option<String> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::debug!("no timezone from {}: {}", path.display(), e);
            return None;
        }
    };
    let zone = text.lines().next()?.trim();
    if zone.is_empty() {
        return None;
    }
    Some(zone.replace('/', "!"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_type_from_flag() {
        assert_eq!(SimType::try_from(1).unwrap(), SimType::Normal);
        assert_eq!(SimType::try_from(2).unwrap(), SimType::CarrierTest);
        assert!(SimType::try_from(3).is_err());
    }

    #[test]
    fn test_netmask_from_prefix() {
        let mut device = DeviceConfig::default();
        assert_eq!(device.netmask(), "255.255.255.0");
        device.ril_prefixlen = 30;
        assert_eq!(device.netmask(), "255.255.255.252");
        device.ril_prefixlen = 0;
        assert_eq!(device.netmask(), "0.0.0.0");
    }

    #[test]
    fn test_load_timezone_replaces_slash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timezone");
        fs::write(&path, "America/Los_Angeles\n").unwrap();
        assert_eq!(load_timezone(&path).as_deref(), Some("America!Los_Angeles"));

        fs::write(&path, "\n").unwrap();
        assert_eq!(load_timezone(&path), None);
        assert_eq!(load_timezone(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_icc_profile_path() {
        let config = SimulatorConfig::new(1, "/tmp/inst");
        assert_eq!(
            config.icc_profile_path(),
            PathBuf::from("/tmp/inst/iccprofile_for_sim1.xml")
        );
        assert_eq!(config.host_port, DEFAULT_HOST_PORT);
    }
}
