use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use ogcapi_replay::{
    config::{Config, FixtureMode},
    fixture::{FixtureKey, FixtureStore},
    logging,
};

#[derive(Debug, Parser)]
#[command(name = "ogcapi-replay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args, Clone, Copy, PartialEq, Eq)]
struct RecordArgs {
    /// Fetch fixtures that are missing from the upstream server.
    #[arg(long)]
    record: bool,
    /// Re-fetch every fixture from the upstream server (implies --record).
    #[arg(long)]
    refresh: bool,
}

impl RecordArgs {
    fn apply(self, config: &mut Config) -> anyhow::Result<()> {
        if self.record || self.refresh {
            config.record.enabled = true;
            config.record.new_only = !self.refresh;
            config.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the replay server.
    Serve {
        /// Optional path to config TOML. If omitted, `ogcapi-replay.toml` is used when present.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        #[command(flatten)]
        record: RecordArgs,
    },
    /// Print the fixture file name a request path is stored under.
    Key {
        /// Request path, e.g. `/fakeogcapi/collections?f=json`.
        path: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List stored fixture keys.
    List {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Start the replay server and run the built-in GDAL scenarios against it.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
        #[command(flatten)]
        record: RecordArgs,
    },
}

fn mode_label(mode: FixtureMode) -> &'static str {
    match mode {
        FixtureMode::Replay => "replay",
        FixtureMode::Record {
            refresh_existing: false,
        } => "record-new",
        FixtureMode::Record {
            refresh_existing: true,
        } => "record-refresh",
    }
}

fn startup_summary(config: &Config, listen_addr: SocketAddr, synthetic_url: &str) -> String {
    let upstream = if config.fixture_mode().is_recording() {
        config.record.upstream.as_str()
    } else {
        "disabled"
    };
    format!(
        "startup config: listen={}, synthetic_url={}, fixtures_dir={}, mode={}, upstream={}",
        listen_addr,
        synthetic_url,
        config.fixtures.dir.display(),
        mode_label(config.fixture_mode()),
        upstream
    )
}

#[cfg(feature = "gdal")]
async fn run_builtin_scenarios(config: &Config) -> anyhow::Result<bool> {
    use ogcapi_replay::{
        gdal_driver::GdalDriver,
        scenario::{ScenarioContext, run_scenarios},
        suite::builtin_scenarios,
    };

    let server = ogcapi_replay::server::serve(config).await?;
    eprintln!(
        "{}",
        startup_summary(config, server.listen_addr, &server.synthetic_url())
    );
    let ctx = ScenarioContext::for_server(&server);
    let report = tokio::task::spawn_blocking(move || {
        run_scenarios(&GdalDriver, &builtin_scenarios(), &ctx)
    })
    .await?;
    print!("{}", report.summary());
    server.shutdown().await?;
    Ok(report.is_success())
}

#[cfg(not(feature = "gdal"))]
async fn run_builtin_scenarios(_config: &Config) -> anyhow::Result<bool> {
    anyhow::bail!("scenarios need GDAL; rebuild with `--features gdal`")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            log_level,
            record,
        } => {
            let mut config = Config::load(config.as_deref())?;
            record.apply(&mut config)?;
            logging::init(&config, log_level.as_deref())?;
            let server = ogcapi_replay::server::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, server.listen_addr, &server.synthetic_url())
            );
            tokio::signal::ctrl_c().await?;
            server.shutdown().await?;
        }
        Command::Key { path, config } => {
            let config = Config::load(config.as_deref())?;
            let key = FixtureKey::derive(&path, &config.server.synthetic_prefix);
            println!("{}", key.file_name());
        }
        Command::List { config } => {
            let config = Config::load(config.as_deref())?;
            let store = FixtureStore::new(&config.fixtures.dir);
            for key in store.list()? {
                println!("{key}");
            }
        }
        Command::Run {
            config,
            log_level,
            record,
        } => {
            let mut config = Config::load(config.as_deref())?;
            record.apply(&mut config)?;
            logging::init(&config, log_level.as_deref())?;
            if !run_builtin_scenarios(&config).await? {
                anyhow::bail!("one or more scenarios failed");
            }
        }
    }

    Ok(())
}
