use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

// Replay traffic is logged at trace, so the default keeps test output clean.
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let raw_level = cli_level_override
            .or_else(|| {
                config
                    .logging
                    .as_ref()
                    .and_then(|logging| logging.level.as_deref())
            })
            .unwrap_or(DEFAULT_LOG_LEVEL);
        let level = raw_level
            .trim()
            .to_ascii_lowercase()
            .parse::<LevelFilter>()
            .map_err(|_| {
                anyhow!(
                    "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
                )
            })?;
        let format = config
            .logging
            .as_ref()
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json);

        Ok(Self { level, format })
    }
}

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_writer(std::io::stderr)
        .with_target(true);

    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}
