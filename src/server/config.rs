// SPDX-License-Identifier: MIT

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{config::duration, error::ErrorLevel};

/// Configuration for the sesame server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The location where the server should store its state.
    ///
    /// This includes an SQLite database holding users, invites, services, and
    /// the record of issued client certificates, as well as the server's TLS
    /// identity. To back up the service, back up this directory.
    ///
    /// Defaults to "/var/lib/sesame" if not set.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// The address to listen on, in host:port format.
    ///
    /// A single port serves both the plain-HTTP /join endpoint and the
    /// mTLS-only privileged endpoints.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// How much error detail unauthenticated peers are shown.
    ///
    /// Endpoints behind mTLS always respond with full error details.
    #[serde(default)]
    pub error_level: ErrorLevel,

    /// The amount of time the server's TLS certificate is valid for.
    #[serde(default = "default_server_cert_lifetime", with = "duration")]
    pub server_cert_lifetime: Duration,

    /// The amount of time issued client TLS certificates are valid for.
    #[serde(default = "default_client_cert_lifetime", with = "duration")]
    pub client_cert_lifetime: Duration,

    /// How long certificate renewal tokens remain valid beyond the
    /// certificate expiration date.
    #[serde(default = "default_renewal_token_window", with = "duration")]
    pub renewal_token_window: Duration,

    /// Firewall backend configuration.
    #[serde(default)]
    pub firewall: FirewallConfig,
}

/// Which firewall backend manages access rules, and its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// The backend used on this system.
    #[serde(default)]
    pub backend: FirewallBackend,

    /// How long clients are granted access when a request doesn't specify a
    /// duration.
    #[serde(default = "default_access_duration", with = "duration")]
    pub default_access_duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// An in-memory backend that records rules without applying them.
    /// Useful for tests and dry runs.
    #[default]
    Mock,
    /// The Linux nftables firewall, driven through the nft CLI.
    Nftables,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::default(),
            default_access_duration: default_access_duration(),
        }
    }
}

impl Config {
    pub fn database(&self) -> PathBuf {
        self.state_directory.join("sesame.sqlite")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            listen_address: default_listen_address(),
            error_level: ErrorLevel::default(),
            server_cert_lifetime: default_server_cert_lifetime(),
            client_cert_lifetime: default_client_cert_lifetime(),
            renewal_token_window: default_renewal_token_window(),
            firewall: FirewallConfig::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("/var/lib/sesame/")
}

fn default_listen_address() -> String {
    "0.0.0.0:4433".to_string()
}

fn default_server_cert_lifetime() -> Duration {
    // ~3 months
    Duration::from_secs(60 * 60 * 24 * 90)
}

fn default_client_cert_lifetime() -> Duration {
    // ~1 month
    Duration::from_secs(60 * 60 * 24 * 30)
}

fn default_renewal_token_window() -> Duration {
    // ~5 months beyond the certificate expiration
    Duration::from_secs(60 * 60 * 24 * 30 * 5)
}

fn default_access_duration() -> Duration {
    Duration::from_secs(5 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_string()).unwrap();
        assert_eq!(config.listen_address, parsed.listen_address);
        assert_eq!(config.client_cert_lifetime, parsed.client_cert_lifetime);
        assert_eq!(config.firewall.backend, parsed.firewall.backend);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen_address = "127.0.0.1:0"
            error_level = "full"

            [firewall]
            backend = "nftables"
            default_access_duration = "10m"
            "#,
        )
        .unwrap();
        assert_eq!(ErrorLevel::Full, config.error_level);
        assert_eq!(FirewallBackend::Nftables, config.firewall.backend);
        assert_eq!(
            Duration::from_secs(600),
            config.firewall.default_access_duration
        );
        assert_eq!(default_client_cert_lifetime(), config.client_cert_lifetime);
    }
}
