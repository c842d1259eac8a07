//! YAML project configuration.
//!
//! A project file defines one or more named debug environments, each
//! selecting a debug tool, a target and (optionally) its own server
//! settings:
//!
//! ```yaml
//! environments:
//!   default:
//!     tool:
//!       kind: simulator
//!     target:
//!       name: atmega328p
//!       physical-interface: debug-wire
//!       manage-dwen-fuse: true
//! server:
//!   host: 127.0.0.1
//!   port: 1442
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::target::avr8::Avr8Config;
use crate::target::PhysicalInterface;

pub const DEFAULT_ENVIRONMENT: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ProjectConfig {
    pub environments: BTreeMap<String, EnvironmentConfig>,

    /// Application-level server configuration; the fallback when an
    /// environment does not define its own.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub debug_logging: bool,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ProjectConfig = serde_yaml::from_str(&contents)?;

        if config.environments.is_empty() {
            return Err(ConfigError::Invalid(
                "the configuration file defines no environments".into(),
            ));
        }

        Ok(config)
    }

    /// Select an environment, resolving the server fallback.
    pub fn environment(&self, name: &str) -> Result<ResolvedEnvironment, ConfigError> {
        let environment = self
            .environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.into()))?;

        Ok(ResolvedEnvironment {
            environment: environment.clone(),
            server: environment
                .server
                .clone()
                .or_else(|| self.server.clone())
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub environment: EnvironmentConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct EnvironmentConfig {
    pub tool: ToolConfig,
    pub target: TargetConfig,

    #[serde(default)]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", tag = "kind")]
pub enum ToolConfig {
    /// The in-process simulated probe and target.
    #[serde(rename = "simulator")]
    Simulator,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Exact target name, e.g. `atmega328p`.
    pub name: String,

    /// Selected variant name, for pin-state consumers.
    #[serde(default)]
    pub variant_name: Option<String>,

    pub physical_interface: PhysicalInterface,

    /// Directory holding YAML device specifications. The built-in
    /// device table is used when absent.
    #[serde(default)]
    pub device_spec_directory: Option<PathBuf>,

    #[serde(default)]
    pub manage_dwen_fuse: bool,

    #[serde(default)]
    pub manage_ocden_fuse: bool,

    #[serde(default = "default_true")]
    pub cycle_target_power_post_dwen_update: bool,

    #[serde(default = "default_power_cycle_delay_ms")]
    pub target_power_cycle_delay_ms: u64,

    #[serde(default)]
    pub disable_debug_wire_on_deactivate: bool,

    #[serde(default = "default_true")]
    pub preserve_eeprom: bool,

    /// Suspend the target controller when a debug session ends,
    /// releasing the probe to other software.
    #[serde(default)]
    pub release_post_session: bool,
}

impl TargetConfig {
    pub fn avr8_config(&self) -> Avr8Config {
        Avr8Config {
            physical_interface: self.physical_interface,
            manage_dwen_fuse: self.manage_dwen_fuse,
            manage_ocden_fuse: self.manage_ocden_fuse,
            cycle_target_power_post_dwen_update: self.cycle_target_power_post_dwen_update,
            target_power_cycle_delay: Duration::from_millis(self.target_power_cycle_delay_ms),
            disable_debug_wire_on_deactivate: self.disable_debug_wire_on_deactivate,
            preserve_eeprom: self.preserve_eeprom,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_true() -> bool {
    true
}

fn default_power_cycle_delay_ms() -> u64 {
    250
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    1442
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "\
environments:
  default:
    tool:
      kind: simulator
    target:
      name: atmega328p
      physical-interface: debug-wire
      manage-dwen-fuse: true
  bench:
    tool:
      kind: simulator
    target:
      name: atmega328p
      physical-interface: updi
    server:
      port: 2331
server:
  host: 0.0.0.0
debug-logging: true
";

    #[test]
    fn parses_environments() {
        let config: ProjectConfig = serde_yaml::from_str(EXAMPLE).unwrap();

        assert!(config.debug_logging);
        assert_eq!(config.environments.len(), 2);

        let default = config.environment("default").unwrap();
        assert_eq!(default.environment.target.name, "atmega328p");
        assert_eq!(
            default.environment.target.physical_interface,
            PhysicalInterface::DebugWire
        );
        assert!(default.environment.target.manage_dwen_fuse);
        // Falls back to the application-level server block
        assert_eq!(default.server.bind_address(), "0.0.0.0:1442");
    }

    #[test]
    fn environment_server_overrides_application_server() {
        let config: ProjectConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let bench = config.environment("bench").unwrap();

        assert_eq!(bench.server.port, 2331);
    }

    #[test]
    fn unknown_environments_are_rejected() {
        let config: ProjectConfig = serde_yaml::from_str(EXAMPLE).unwrap();

        assert!(matches!(
            config.environment("production"),
            Err(ConfigError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn defaults_are_applied() {
        let config: ProjectConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let target = &config.environment("bench").unwrap().environment.target;

        assert!(!target.manage_dwen_fuse);
        assert!(target.preserve_eeprom);
        assert!(target.cycle_target_power_post_dwen_update);
        assert_eq!(target.target_power_cycle_delay_ms, 250);
    }
}
