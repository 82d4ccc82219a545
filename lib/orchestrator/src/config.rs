// SPDX-License-Identifier: Apache-2.0

//! Orchestrator configuration.
//!
//! Configuration is loaded from, in increasing priority:
//!
//! 1. Built-in defaults.
//! 2. An optional TOML file pointed to by `STASH_CONFIG_PATH`.
//! 3. Environment variables (`STASH_FS_*` for the filesystem section,
//!    `STASH_REGISTRY_*` for the registry section).

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// ENV used to set the path to the TOML configuration file
const CONFIG_PATH_ENV: &str = "STASH_CONFIG_PATH";

/// Filesystem provisioning options consumed by the inventory builder and the
/// external playbook runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Device name used for the Lustre MGS on the primary brick host.
    pub mgs_device: String,
    /// Cap on the global MDT count per filesystem.
    pub max_mdts: u32,
    /// Top-level inventory key the provisioner targets.
    pub host_group: String,
    /// Emitted into the inventory as `<N>m`.
    pub mdt_size_mb: u32,
    /// Appended to host names in LNet configuration.
    pub lnet_suffix: String,
    /// When true the provisioner dry-runs.
    pub skip_ansible: bool,
    /// Directory holding the provisioning playbooks.
    pub ansible_dir: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            mgs_device: "sdb".to_string(),
            max_mdts: 24,
            host_group: "dac-prod".to_string(),
            mdt_size_mb: 20 * 1024,
            lnet_suffix: String::new(),
            skip_ansible: false,
            ansible_dir: "/var/lib/stash/fs-ansible/".to_string(),
        }
    }
}

impl FilesystemConfig {
    /// Load the filesystem section from file and environment.
    pub fn load() -> anyhow::Result<Self> {
        figment(Self::default(), "filesystem", "STASH_FS_")
            .extract()
            .context("invalid filesystem configuration")
    }
}

/// Connection settings for the distributed registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout_ms: u64,
    /// Upper bound on a single registry round trip.
    pub op_timeout_ms: u64,
    /// TTL of the lease brick hosts keep alive while registered.
    pub host_lease_ttl_secs: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            dial_timeout_ms: 5_000,
            op_timeout_ms: 10_000,
            host_lease_ttl_secs: 10,
        }
    }
}

impl RegistryConfig {
    pub fn load() -> anyhow::Result<Self> {
        figment(Self::default(), "registry", "STASH_REGISTRY_")
            .extract()
            .context("invalid registry configuration")
    }
}

fn figment<T: Serialize>(defaults: T, section: &str, env_prefix: &str) -> Figment {
    let mut fig = Figment::from(Serialized::defaults(defaults));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        fig = fig.merge(Figment::from(Toml::file(path)).focus(section));
    }
    fig.merge(Env::prefixed(env_prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_defaults() {
        let actual = FilesystemConfig::default();
        let expected = FilesystemConfig {
            mgs_device: "sdb".to_string(),
            max_mdts: 24,
            host_group: "dac-prod".to_string(),
            mdt_size_mb: 20480,
            lnet_suffix: String::new(),
            skip_ansible: false,
            ansible_dir: "/var/lib/stash/fs-ansible/".to_string(),
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn load_without_overrides_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let actual = FilesystemConfig::load().expect("load");
            assert_eq!(actual, FilesystemConfig::default());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STASH_FS_MAX_MDTS", "8");
            jail.set_env("STASH_FS_SKIP_ANSIBLE", "true");
            let actual = FilesystemConfig::load().expect("load");
            assert_eq!(actual.max_mdts, 8);
            assert!(actual.skip_ansible);
            assert_eq!(actual.mgs_device, "sdb");
            Ok(())
        });
    }

    #[test]
    fn registry_defaults() {
        let conf = RegistryConfig::default();
        assert_eq!(conf.endpoints, vec!["http://localhost:2379".to_string()]);
        assert_eq!(conf.host_lease_ttl_secs, 10);
    }
}
