use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Daemon settings, read from a sectioned TOML file. Section and option names
/// follow the historical deployer.ini layout.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub general: General,
    pub database: Database,
    #[serde(default)]
    pub mail: Mail,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub integration: Integration,
    #[serde(default)]
    pub inventory: Inventory,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// Base directory holding the local repository mirrors.
    pub local_repo_path: PathBuf,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
    #[serde(default)]
    pub haproxy_user: String,
    #[serde(default)]
    pub haproxy_pass: String,
    /// Always CC'd on deployment mails. Comma-separated.
    #[serde(default)]
    pub notify_mails: String,
    #[serde(default)]
    pub carbon_host: Option<String>,
    #[serde(default = "default_carbon_port")]
    pub carbon_port: u16,
    /// Release auditor period, in seconds.
    #[serde(default = "default_check_releases_frequency")]
    pub check_releases_frequency: u64,
    /// Environments the release auditor skips. Comma-separated.
    #[serde(default)]
    pub check_releases_ignore_environments: String,
    /// Command run as `<cmd> <url> <output.png>` after a deployment when the
    /// repository's deploy.json maps the environment to a URL.
    #[serde(default)]
    pub screenshot_command: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Database {
    /// SQLite database URL, e.g. `sqlite:///var/lib/slipway/deployer.sqlite`.
    pub connection: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Mail {
    #[serde(default)]
    pub mta: Option<String>,
    #[serde(default = "default_mail_sender")]
    pub sender: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    /// All deployer instances, this one included. Comma-separated URLs.
    #[serde(default)]
    pub deployers_urls: String,
    #[serde(default)]
    pub this_deployer_url: String,
    #[serde(default)]
    pub this_deployer_username: String,
    #[serde(default)]
    pub this_deployer_token: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Integration {
    /// Name of a compiled-in integration provider.
    #[serde(default = "default_provider")]
    pub provider: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub activate: bool,
    #[serde(default)]
    pub api_host: Option<String>,
    /// Checker period, in minutes.
    #[serde(default = "default_update_frequency")]
    pub update_frequency: u64,
}

impl Default for Integration {
    fn default() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("could not read settings at {}: {e}", path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn notify_mails(&self) -> Vec<String> {
        split_list(&self.general.notify_mails)
    }

    pub fn ignored_environments(&self) -> Vec<String> {
        split_list(&self.general.check_releases_ignore_environments)
    }

    pub fn deployers_urls(&self) -> Vec<String> {
        split_list(&self.cluster.deployers_urls)
    }

    /// Peer deployer URLs, this instance excluded.
    pub fn other_deployers_urls(&self) -> Vec<String> {
        self.deployers_urls()
            .into_iter()
            .filter(|url| *url != self.cluster.this_deployer_url)
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn default_api_port() -> u16 {
    8000
}

fn default_websocket_port() -> u16 {
    8001
}

fn default_carbon_port() -> u16 {
    2003
}

fn default_check_releases_frequency() -> u64 {
    600
}

fn default_mail_sender() -> String {
    "deployer@localhost".into()
}

fn default_provider() -> String {
    "default".into()
}

fn default_update_frequency() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_parse_with_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [general]
            local_repo_path = "/var/lib/slipway/mirrors"

            [database]
            connection = "sqlite::memory:"
            "#,
        )
        .unwrap();

        assert_eq!(settings.general.api_port, 8000);
        assert_eq!(settings.general.check_releases_frequency, 600);
        assert_eq!(settings.integration.provider, "default");
        assert!(!settings.inventory.activate);
    }

    #[test]
    fn peer_urls_exclude_this_instance() {
        let settings: Settings = toml::from_str(
            r#"
            [general]
            local_repo_path = "/tmp/mirrors"

            [database]
            connection = "sqlite::memory:"

            [cluster]
            deployers_urls = "http://a:8000, http://b:8000"
            this_deployer_url = "http://a:8000"
            "#,
        )
        .unwrap();

        assert_eq!(settings.other_deployers_urls(), vec!["http://b:8000"]);
    }
}
