use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use geofix_logic::LocationSettings;
use geofix_sim::{
    ConnectOutcome, RunOptions, SettingsOutcome, SimScenario, prelude::*, run_scenario,
};
use log::info;

#[derive(Parser)]
struct Cli {
    /// JSON file describing how the provider behaves, missing fields use defaults
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// JSON file with location settings, missing fields use defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override how connecting to the provider goes
    #[arg(long, value_enum)]
    connect: Option<ConnectValue>,

    /// Override the result of the settings check
    #[arg(long = "settings-check", value_enum)]
    settings_check: Option<SettingsValue>,

    /// Start with the provider already connected
    #[arg(long)]
    already_connected: bool,

    /// Give the provider a last known fix from before the run
    #[arg(long)]
    cached_fix: bool,

    /// Act as if location permission was never granted
    #[arg(long)]
    deny_permission: bool,

    /// Run with an interactive host that can show resolutions
    #[arg(long)]
    interactive: bool,

    /// Milliseconds between subscribing and the provider reporting a fix
    #[arg(long, conflicts_with = "no_fix")]
    fix_delay_ms: Option<u64>,

    /// Provider never reports a fix after subscribing
    #[arg(long)]
    no_fix: bool,

    /// Let the host try to resolve settings and connection problems
    #[arg(long)]
    resolve_on_error: bool,

    /// Don't accept the provider's last known fix
    #[arg(long)]
    force_new: bool,

    /// Number of requests to make
    #[arg(long, default_value_t = 1)]
    requests: usize,

    /// Milliseconds to wait between requests
    #[arg(long, default_value_t = 0)]
    gap_ms: u64,

    /// Shut the helper down after this many seconds if requests are still pending
    #[arg(long, default_value_t = 60)]
    give_up_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ConnectValue {
    Succeed,
    FailResolvable,
    FailUnresolvable,
    Hang,
}

impl From<ConnectValue> for ConnectOutcome {
    fn from(value: ConnectValue) -> Self {
        match value {
            ConnectValue::Succeed => ConnectOutcome::Succeed,
            ConnectValue::FailResolvable => ConnectOutcome::FailResolvable,
            ConnectValue::FailUnresolvable => ConnectOutcome::FailUnresolvable,
            ConnectValue::Hang => ConnectOutcome::Hang,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum SettingsValue {
    Satisfied,
    ResolutionRequired,
    ChangeUnavailable,
}

impl From<SettingsValue> for SettingsOutcome {
    fn from(value: SettingsValue) -> Self {
        match value {
            SettingsValue::Satisfied => SettingsOutcome::Satisfied,
            SettingsValue::ResolutionRequired => SettingsOutcome::ResolutionRequired,
            SettingsValue::ChangeUnavailable => SettingsOutcome::ChangeUnavailable,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: Option<&PathBuf>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

impl Cli {
    fn scenario(&self) -> Result<SimScenario> {
        let mut scenario: SimScenario = read_json(self.scenario.as_ref())?;

        if let Some(connect) = self.connect {
            scenario.connect = connect.into();
        }
        if let Some(check) = self.settings_check {
            scenario.settings = check.into();
        }
        scenario.already_connected |= self.already_connected;
        scenario.cached_fix |= self.cached_fix;
        scenario.interactive |= self.interactive;
        if self.deny_permission {
            scenario.permission_granted = false;
        }
        if self.no_fix {
            scenario.fix_delay_ms = None;
        } else if let Some(delay) = self.fix_delay_ms {
            scenario.fix_delay_ms = Some(delay);
        }

        Ok(scenario)
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            requests: self.requests,
            gap: Duration::from_millis(self.gap_ms),
            resolve_on_error: self.resolve_on_error,
            force_new_location: self.force_new,
            give_up: Some(Duration::from_secs(self.give_up_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> Result {
    colog::init();

    let cli = Cli::parse();

    let scenario = cli.scenario().context("Failed to load scenario")?;
    let settings: LocationSettings =
        read_json(cli.settings.as_ref()).context("Failed to load settings")?;

    info!("Running {} request(s) against {scenario:?}", cli.requests);

    let report = run_scenario(scenario, settings, cli.options()).await?;

    let out = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{out}");

    Ok(())
}
