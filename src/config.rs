use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "ogcapi-replay.toml";
pub const DEFAULT_SYNTHETIC_PREFIX: &str = "/fakeogcapi";
pub const DEFAULT_FIXTURES_DIR: &str = "tests/data/ogcapi";
pub const DEFAULT_UPSTREAM: &str = "https://maps.gnosis.earth/ogcapi";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads `path` when given, otherwise `ogcapi-replay.toml` from the
    /// working directory, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        let discovered = Path::new(DEFAULT_CONFIG_FILENAME);
        if discovered.is_file() {
            return Self::from_path(discovered);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Replay-only configuration serving fixtures from `dir` on an ephemeral port.
    pub fn for_fixtures(dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures: FixturesConfig { dir: dir.into() },
            ..Self::default()
        }
    }

    pub fn fixture_mode(&self) -> FixtureMode {
        if self.record.enabled {
            FixtureMode::Record {
                refresh_existing: !self.record.new_only,
            }
        } else {
            FixtureMode::Replay
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let prefix = &self.server.synthetic_prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 {
            bail!("`server.synthetic_prefix` must start with `/` and name a path segment");
        }
        if let Some(ch) = prefix[1..]
            .chars()
            .find(|ch| *ch != '/' && crate::fixture::RESERVED_CHARS.contains(ch))
        {
            bail!("`server.synthetic_prefix` cannot contain reserved character `{ch}`");
        }
        if self.record.enabled {
            let upstream = self.record.upstream.trim();
            if !(upstream.starts_with("http://") || upstream.starts_with("https://")) {
                bail!("`record.upstream` must be an http or https URL when recording is enabled");
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_synthetic_prefix")]
    pub synthetic_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            synthetic_prefix: default_synthetic_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixturesConfig {
    #[serde(default = "default_fixtures_dir")]
    pub dir: PathBuf,
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            dir: default_fixtures_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_new_only")]
    pub new_only: bool,
    #[serde(default = "default_upstream")]
    pub upstream: String,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            new_only: default_new_only(),
            upstream: default_upstream(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// How synthetic requests are satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureMode {
    Replay,
    Record { refresh_existing: bool },
}

impl FixtureMode {
    pub fn is_recording(self) -> bool {
        matches!(self, Self::Record { .. })
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_synthetic_prefix() -> String {
    DEFAULT_SYNTHETIC_PREFIX.to_owned()
}

fn default_fixtures_dir() -> PathBuf {
    PathBuf::from(DEFAULT_FIXTURES_DIR)
}

fn default_new_only() -> bool {
    true
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Config, FixtureMode, LogFormat};

    #[test]
    fn empty_config_uses_replay_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen.to_string(), "127.0.0.1:0");
        assert_eq!(config.server.synthetic_prefix, "/fakeogcapi");
        assert_eq!(config.fixtures.dir, Path::new("tests/data/ogcapi"));
        assert_eq!(config.fixture_mode(), FixtureMode::Replay);
        assert!(config.logging.is_none());
    }

    #[test]
    fn record_toggles_map_to_fixture_mode() {
        let config = Config::from_toml_str(
            r#"
[record]
enabled = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.fixture_mode(),
            FixtureMode::Record {
                refresh_existing: false
            }
        );

        let config = Config::from_toml_str(
            r#"
[record]
enabled = true
new_only = false
upstream = "http://127.0.0.1:9000/ogcapi"
"#,
        )
        .unwrap();
        assert_eq!(
            config.fixture_mode(),
            FixtureMode::Record {
                refresh_existing: true
            }
        );
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml_str(
            r#"
[server]
listen = "127.0.0.1:8081"
synthetic_prefix = "/replayed"

[fixtures]
dir = "/tmp/fixtures"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 8081);
        assert_eq!(config.server.synthetic_prefix, "/replayed");
        assert_eq!(config.fixtures.dir, Path::new("/tmp/fixtures"));
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        for prefix in ["fake", "/", "/fake?x", "/a=b"] {
            let toml = format!("[server]\nsynthetic_prefix = \"{prefix}\"\n");
            assert!(
                Config::from_toml_str(&toml).is_err(),
                "prefix `{prefix}` should fail"
            );
        }
    }

    #[test]
    fn recording_requires_http_upstream() {
        let err = Config::from_toml_str(
            r#"
[record]
enabled = true
upstream = "ftp://example.com/ogcapi"
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("record.upstream"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml_str("[server]\nport = 1\n").is_err());
    }
}
