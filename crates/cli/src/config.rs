//! bulkctl configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use transport::{NINTENDO_VENDOR_ID, TransportConfig};

/// Log levels accepted in `[logging] level`
pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    pub device: DeviceSettings,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which device to open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(with = "hex_id")]
    pub vendor_id: u16,
    #[serde(with = "hex_id")]
    pub product_id: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                vendor_id: NINTENDO_VENDOR_ID,
                product_id: 0x2069,
            },
            transport: TransportConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Parse a 16-bit id written as `057e` or `0x057e`
pub fn parse_hex_id(value: &str, name: &'static str) -> crate::Result<u16> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 4 {
        return Err(crate::Error::InvalidId {
            name,
            value: value.to_string(),
        });
    }

    u16::from_str_radix(digits, 16).map_err(|_| crate::Error::InvalidId {
        name,
        value: value.to_string(),
    })
}

/// Serde helpers storing ids as `"0x057e"` strings
mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(id: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:04x}", id))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_hex_id(&s, "id").map_err(D::Error::custom)
    }
}

impl CliConfig {
    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// `<config_dir>/bulk-usb/bulkctl.toml`
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bulk-usb").join("bulkctl.toml")
        } else {
            PathBuf::from(".config/bulk-usb/bulkctl.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        if self.device.vendor_id == 0 || self.device.product_id == 0 {
            return Err(anyhow!(
                "Device ids must be non-zero (got {:04x}:{:04x})",
                self.device.vendor_id,
                self.device.product_id
            ));
        }

        if self.transport.read_chunk_size == 0 {
            return Err(anyhow!("transport.read_chunk_size must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliConfig::default();
        assert_eq!(config.device.vendor_id, 0x057e);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("057e", "vendor_id").unwrap(), 0x057e);
        assert_eq!(parse_hex_id("0x2069", "product_id").unwrap(), 0x2069);
        assert_eq!(parse_hex_id("0XABCD", "product_id").unwrap(), 0xabcd);
        assert!(parse_hex_id("", "vendor_id").is_err());
        assert!(parse_hex_id("0x", "vendor_id").is_err());
        assert!(parse_hex_id("12345", "vendor_id").is_err());
        assert!(parse_hex_id("zz", "vendor_id").is_err());
    }

    #[test]
    fn test_minimal_config_uses_transport_defaults() {
        let config: CliConfig = toml::from_str(
            r#"
[device]
vendor_id = "057e"
product_id = "0x2069"
"#,
        )
        .unwrap();

        assert_eq!(config.device.product_id, 0x2069);
        assert_eq!(config.transport, TransportConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_ids_serialize_as_hex_strings() {
        let content = toml::to_string(&CliConfig::default()).unwrap();
        assert!(content.contains("vendor_id = \"0x057e\""));
        assert!(content.contains("product_id = \"0x2069\""));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = CliConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_ids() {
        let mut config = CliConfig::default();
        config.device.product_id = 0;
        assert!(config.validate().is_err());
    }
}
