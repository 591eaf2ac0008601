// SPDX-License-Identifier: MIT

use std::{env, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Paths to the credentials a client uses for privileged requests.
///
/// Both files are produced by a successful join: the CA certificate pins the
/// remote node, and the credential bundle holds the client certificate chain
/// and private key in a single PEM file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The path to the PEM bundle containing the client certificate chain and
    /// its private key.
    pub credential: PathBuf,
    /// The path to the PEM-encoded CA certificate of the remote node.
    pub ca_certificate: PathBuf,
}

/// Configuration for the sesame client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The directory where credentials received from remote nodes are stored.
    ///
    /// Defaults to "/var/lib/sesame-client" if not set.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// The address of the remote node, in host:port format.
    pub server_address: String,

    /// How long to wait for a /join exchange to complete.
    #[serde(default = "default_join_timeout", with = "duration")]
    pub join_timeout: Duration,

    /// How long to wait for privileged requests (/open, /close) to complete.
    #[serde(default = "default_request_timeout", with = "duration")]
    pub request_timeout: Duration,
}

impl Config {
    /// The credential paths for a given remote, inside the state directory.
    pub fn credentials(&self, site_id: &str) -> Credentials {
        Credentials {
            credential: self
                .state_directory
                .join(format!("{site_id}.credential.pem")),
            ca_certificate: self
                .state_directory
                .join(format!("{site_id}.ca_certificate.pem")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            server_address: "sesame.example.com:4433".to_string(),
            join_timeout: default_join_timeout(),
            request_timeout: default_request_timeout(),
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
    PathBuf::from("/var/lib/sesame-client/")
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Serde support for durations in friendly "90d 12h" notation.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to
/// CONFIGURATION_DIRECTORY, is checked. If the default config doesn't exist,
/// the [`Default`] implementation is returned. It's expected that
/// CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error
/// is returned.
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_render_as_toml() {
        let config = Config::default();
        let rendered = config.to_string();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(config.server_address, parsed.server_address);
        assert_eq!(config.join_timeout, parsed.join_timeout);
    }

    #[test]
    fn durations_parse_from_friendly_strings() {
        let config: Config = toml::from_str(
            r#"
            server_address = "remote.example.com:4433"
            join_timeout = "30s"
            request_timeout = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(Duration::from_secs(30), config.join_timeout);
        assert_eq!(Duration::from_secs(120), config.request_timeout);
    }

    #[test]
    fn credentials_are_scoped_by_site() {
        let config = Config::default();
        let creds = config.credentials("home");
        assert!(creds.credential.ends_with("home.credential.pem"));
        assert!(creds.ca_certificate.ends_with("home.ca_certificate.pem"));
    }
}
