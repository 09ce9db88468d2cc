//! Session configuration and fixed constants.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::descriptor::DeviceId;

/// Vendor ID of the target device.
pub const DEFAULT_VENDOR_ID: u16 = 0x0000;
/// Product ID of the target device.
pub const DEFAULT_PRODUCT_ID: u16 = 0x0000;

/// Only interface 0 is ever claimed.
pub const INTERFACE_INDEX: u8 = 0;

/// Status code reported when a write is attempted without an open connection.
pub const NOT_CONNECTED: i32 = -2;
/// Status code reported for any failed transfer.
pub const TRANSFER_FAILED: i32 = -1;

pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_PERMISSION_TIMEOUT_SECS: u64 = 30;

/// Configuration for a `UsbSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Vendor ID to look for.
    pub vendor_id: u16,
    /// Product ID to look for.
    pub product_id: u16,
    /// Bulk OUT timeout in milliseconds.
    pub write_timeout_ms: u64,
    /// Bulk IN wait timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// How long a blocking permission request waits for an answer.
    pub permission_timeout_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            permission_timeout_secs: DEFAULT_PERMISSION_TIMEOUT_SECS,
        }
    }
}

impl HelperConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HelperConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.vendor_id, self.product_id)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_fixed_ids() {
        let config = HelperConfig::default();
        assert_eq!(config.device_id(), DeviceId::new(0x0000, 0x0000));
        assert_eq!(config.write_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: HelperConfig = toml::from_str("vendor_id = 11584\nproduct_id = 183\n").unwrap();
        assert_eq!(config.vendor_id, 0x2D40);
        assert_eq!(config.product_id, 0x00B7);
        assert_eq!(config.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("usbhelper-config-{}.toml", std::process::id()));
        let config = HelperConfig {
            vendor_id: 0x1209,
            product_id: 0x0001,
            write_timeout_ms: 250,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = HelperConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
