//! Configuration management for the PAN server daemon.
//!
//! This module handles loading and saving configuration from disk: link
//! security, the kernel interface prefix and the per-role server settings
//! (name, routing, address range, bridge, enabled flag).

use std::{collections::BTreeSet, env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   bnep::proto::SvcRole,
   error::{PanError, Result},
};

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Require an authenticated and encrypted link on the BNEP socket.
   #[serde(default = "default_secure")]
   pub secure: bool,

   /// Prefix for kernel-allocated BNEP interface names.
   #[serde(default = "default_interface_prefix")]
   pub interface_prefix: String,

   #[serde(default = "default_nap")]
   pub nap: ServerConfig,

   #[serde(default = "default_gn")]
   pub gn: ServerConfig,

   #[serde(default = "default_panu")]
   pub panu: ServerConfig,
}

/// Settings for one server role.
#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
   /// Service name advertised in the discovery record.
   pub name: String,

   /// Interface traffic is routed towards in routed mode.
   #[serde(default)]
   pub routing: Option<String>,

   /// Address range handed out to peers, first address is ours.
   #[serde(default)]
   pub address_range: Option<String>,

   /// Bridge admitted interfaces are attached to, if any.
   #[serde(default)]
   pub bridge: Option<String>,

   #[serde(default)]
   pub enabled: bool,
}

impl ServerConfig {
   fn named(name: &str) -> Self {
      Self {
         name: name.to_owned(),
         routing: None,
         address_range: None,
         bridge: None,
         enabled: false,
      }
   }
}

fn default_secure() -> bool {
   true
}

fn default_interface_prefix() -> String {
   "bnep".to_owned()
}

fn default_nap() -> ServerConfig {
   ServerConfig::named("NAP service")
}

fn default_gn() -> ServerConfig {
   let mut config = ServerConfig::named("GN service");
   config.bridge = Some("pan0".to_owned());
   config
}

fn default_panu() -> ServerConfig {
   ServerConfig::named("PANU service")
}

impl Default for Config {
   fn default() -> Self {
      Self {
         secure: default_secure(),
         interface_prefix: default_interface_prefix(),
         nap: default_nap(),
         gn: default_gn(),
         panu: default_panu(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(bnepd_home) = env::var("BNEPD_HOME") {
         PathBuf::from(bnepd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(PanError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bnepd").join("config.toml"))
   }

   /// Settings for the server instance of `role`.
   pub fn server(&self, role: SvcRole) -> &ServerConfig {
      match role {
         SvcRole::Nap => &self.nap,
         SvcRole::Gn => &self.gn,
         SvcRole::Panu => &self.panu,
      }
   }

   pub fn server_mut(&mut self, role: SvcRole) -> &mut ServerConfig {
      match role {
         SvcRole::Nap => &mut self.nap,
         SvcRole::Gn => &mut self.gn,
         SvcRole::Panu => &mut self.panu,
      }
   }

   /// Distinct bridges configured across all roles.
   pub fn bridges(&self) -> BTreeSet<String> {
      [&self.nap, &self.gn, &self.panu]
         .into_iter()
         .filter_map(|s| s.bridge.clone())
         .collect()
   }
}
