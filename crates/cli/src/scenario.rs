//! Scenario files.
//!
//! A scenario describes one page session: settings, ad definitions, the
//! plugins to register (with simulated latencies and failures) and a timeline
//! of actions. Example:
//!
//! ```toml
//! run_for_ms = 3000
//!
//! [settings]
//! bidder_timeout_ms = 800
//!
//! [[ads]]
//! elementId = "top"
//! sizes = [[728, 90]]
//! gpt = { adUnitPath = "/1234/top" }
//! prebid = { bids = [] }
//!
//! [[plugins]]
//! name = "gpt"
//! type = "adServer"
//! init_delay_ms = 120
//!
//! [[plugins]]
//! name = "prebid"
//! type = "headerBidding"
//! response_ms = 300
//!
//! [[actions]]
//! at_ms = 0
//! request = ["top"]
//! ```
//!
//! A plugin serves the ads listed in its `serves` array, or when `serves` is
//! omitted, every ad carrying a payload table named after the plugin.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use bidflow_common::ad_config::AdConfig;
use bidflow_common::event::PluginType;
use bidflow_common::settings::{SettingKey, Settings};
use serde::Deserialize;

use crate::error::CliError;

/// Default length of a simulated session when `run_for_ms` is omitted.
const DEFAULT_RUN_FOR_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScenario {
    run_for_ms: Option<u64>,
    #[serde(default)]
    settings: toml::Table,
    #[serde(default)]
    ads: Vec<AdConfig>,
    #[serde(default)]
    plugins: Vec<RawPlugin>,
    #[serde(default)]
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlugin {
    name: String,
    #[serde(rename = "type")]
    plugin_type: String,
    #[serde(default)]
    init_delay_ms: u64,
    #[serde(default)]
    never_ready: bool,
    #[serde(default)]
    response_ms: u64,
    #[serde(default)]
    never_responds: bool,
    #[serde(default)]
    fail: Vec<FailurePoint>,
    serves: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    at_ms: u64,
    request: Option<Vec<String>>,
    destroy: Option<Vec<String>>,
    #[serde(default)]
    new_page: bool,
    set: Option<RawSet>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSet {
    name: String,
    value: u64,
}

/// A plugin call the simulation can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePoint {
    DefineUnit,
    RequestAdServer,
    RequestBids,
    BeforeRequestAdServer,
    DestroyUnits,
    LoadNewPage,
}

/// How a simulated plugin behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub plugin_type: PluginType,
    /// `None` means init never completes.
    pub init_delay: Option<Duration>,
    /// `None` means bids are never reported done.
    pub response: Option<Duration>,
    pub fail: BTreeSet<FailurePoint>,
    pub serves: Option<Vec<String>>,
}

impl PluginSpec {
    pub fn fails(&self, point: FailurePoint) -> bool {
        self.fail.contains(&point)
    }

    /// Whether this plugin defines a unit for `ad_config`.
    pub fn serves(&self, ad_config: &AdConfig) -> bool {
        match &self.serves {
            Some(ids) => ids.contains(&ad_config.element_id),
            None => ad_config.payload(&self.name).is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Request(Vec<String>),
    Destroy(Vec<String>),
    LoadNewPage,
    Set(SettingKey, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub at: Duration,
    pub action: Action,
}

/// A validated scenario, steps sorted by time.
#[derive(Debug)]
pub struct Scenario {
    pub settings: Settings,
    pub ads: Vec<AdConfig>,
    pub plugins: Vec<PluginSpec>,
    pub steps: Vec<Step>,
    pub run_for: Duration,
}

impl Scenario {
    /// Read and validate a scenario file.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a scenario document.
    ///
    /// Settings go through [`Settings::from_toml`], so `BIDFLOW__*`
    /// environment overrides apply here too.
    pub fn from_toml_str(content: &str) -> Result<Self, CliError> {
        let raw: RawScenario = toml::from_str(content)?;

        let settings_toml = toml::to_string(&raw.settings)
            .map_err(|e| CliError::Config(format!("Failed to re-encode settings: {e}")))?;
        let settings = Settings::from_toml(&settings_toml)
            .map_err(|e| CliError::Config(format!("Invalid settings: {e:?}")))?;

        if let Some(config) = raw.ads.iter().find(|config| config.element_id.is_empty()) {
            return Err(CliError::Scenario(format!(
                "ad definition without elementId: {config:?}"
            )));
        }

        let plugins = raw
            .plugins
            .into_iter()
            .map(plugin_spec)
            .collect::<Result<Vec<_>, _>>()?;

        let mut steps = raw
            .actions
            .into_iter()
            .map(step)
            .collect::<Result<Vec<_>, _>>()?;
        steps.sort_by_key(|step| step.at);

        let run_for = Duration::from_millis(raw.run_for_ms.unwrap_or(DEFAULT_RUN_FOR_MS));
        if let Some(last) = steps.last() {
            if last.at > run_for {
                return Err(CliError::Scenario(format!(
                    "action at {}ms is after the end of the run ({}ms)",
                    last.at.as_millis(),
                    run_for.as_millis()
                )));
            }
        }

        Ok(Self {
            settings,
            ads: raw.ads,
            plugins,
            steps,
            run_for,
        })
    }
}

fn plugin_spec(raw: RawPlugin) -> Result<PluginSpec, CliError> {
    let plugin_type: PluginType = raw
        .plugin_type
        .parse::<PluginType>()
        .map_err(|e| {
            CliError::Scenario(format!("plugin '{}': {}", raw.name, e.current_context()))
        })?;

    Ok(PluginSpec {
        name: raw.name,
        plugin_type,
        init_delay: (!raw.never_ready).then(|| Duration::from_millis(raw.init_delay_ms)),
        response: (!raw.never_responds).then(|| Duration::from_millis(raw.response_ms)),
        fail: raw.fail.into_iter().collect(),
        serves: raw.serves,
    })
}

fn step(raw: RawAction) -> Result<Step, CliError> {
    let at = Duration::from_millis(raw.at_ms);
    let mut actions = Vec::new();
    if let Some(ids) = raw.request {
        actions.push(Action::Request(ids));
    }
    if let Some(ids) = raw.destroy {
        actions.push(Action::Destroy(ids));
    }
    if raw.new_page {
        actions.push(Action::LoadNewPage);
    }
    if let Some(set) = raw.set {
        let key: SettingKey = set
            .name
            .parse::<SettingKey>()
            .map_err(|e| {
                CliError::Scenario(format!("action at {}ms: {}", raw.at_ms, e.current_context()))
            })?;
        actions.push(Action::Set(key, set.value));
    }

    match actions.len() {
        1 => Ok(Step {
            at,
            action: actions.remove(0),
        }),
        n => Err(CliError::Scenario(format!(
            "action at {}ms must do exactly one thing, found {n}",
            raw.at_ms
        ))),
    }
}
