//! Configuration management for the bridge service.
//!
//! This module handles loading and saving configuration from disk,
//! including transport defaults, queue sizing and known devices.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   error::{BridgeError, Result},
   transport::ConnMethod,
};

/// Which radios a scan asks BlueZ to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTransport {
   #[default]
   Auto,
   Le,
   Bredr,
}

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// BlueZ adapter name, the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default)]
   pub default_method: ConnMethod,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_open_timeout")]
   pub open_timeout_secs: u64,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_secs: u64,

   /// Bound on pending jobs, unbounded when unset.
   #[serde(default)]
   pub queue_capacity: Option<usize>,

   #[serde(default)]
   pub scan_transport: ScanTransport,

   #[serde(default)]
   pub ble_write_uuid: Option<Uuid>,

   #[serde(default)]
   pub ble_notify_uuid: Option<Uuid>,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// A device whose display name is known ahead of discovery.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_rfcomm_channel() -> u8 {
   1
}

const fn default_open_timeout() -> u64 {
   10
}

const fn default_write_timeout() -> u64 {
   25
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         default_method: ConnMethod::default(),
         rfcomm_channel: default_rfcomm_channel(),
         open_timeout_secs: default_open_timeout(),
         write_timeout_secs: default_write_timeout(),
         queue_capacity: None,
         scan_transport: ScanTransport::default(),
         ble_write_uuid: None,
         ble_notify_uuid: None,
         known_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTBRIDGE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(BridgeError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btbridge").join("config.toml"))
   }
}
