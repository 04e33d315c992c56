use crate::queue;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG_PATH: &str = "/etc/steward/steward.toml";
const ENV_PREFIX: &str = "STEWARD_";

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub storage: Storage,
    pub queue: Queue,
    pub consumer: Consumer,
}

#[derive(Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
    pub log_format: LogFormat,

    /// How long events are kept before being pruned, in seconds.
    pub event_retention: u64,

    /// How often the event pruning job runs, in seconds.
    pub event_prune_interval: u64,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub path: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub engine: queue::Engine,

    /// Where resource requests for the external executor are sent.
    pub resource_request_queue: String,

    /// Where the external executor reports step progress.
    pub deployment_status_queue: String,

    /// How long a single receive call blocks waiting for a message, in seconds.
    pub max_wait: u64,

    /// Deliveries that keep failing are dropped once they have been handed out this many times.
    pub max_delivery_count: u32,

    /// How long a received message stays hidden before it is handed out again, in seconds. sqlite engine only.
    pub lock_duration: u64,

    /// How often an idle receiver checks for new messages, in milliseconds. sqlite engine only.
    pub poll_interval: u64,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// How many times a pipeline step patch is retried after losing an etag race.
    pub patch_retries: u32,
    pub heartbeat_check_interval: u64,
    pub heartbeat_staleness_threshold: u64,
    pub restart_delay_base: u64,
    pub restart_delay_max: u64,
}

impl Config {
    /// returns an embedded default configuration file as a string.
    fn default_config() -> Result<String> {
        let config_file = EmbeddedConfigFS::get("default_config.toml")
            .context("Could not find embedded default configuration")?;

        let config = std::str::from_utf8(&config_file.data)
            .context("Embedded default configuration is not valid utf-8")?;

        Ok(config.to_string())
    }

    /// Returns a correctly deserialized config struct from the configuration sources available.
    ///
    /// Sources are layered in order; later sources override keys from earlier ones:
    /// 1. The embedded defaults.
    /// 2. The file at `path_override`, or the default path if no override is given. A missing file is skipped.
    /// 3. Environment variables prefixed with `STEWARD_`, using `__` to separate nested keys
    ///    (ex. `STEWARD_GENERAL__LOG_LEVEL`).
    pub fn load(path_override: Option<&str>) -> Result<Self> {
        let path = path_override.unwrap_or(DEFAULT_CONFIG_PATH);

        Figment::new()
            .merge(Toml::string(&Self::default_config()?))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<Config>()
            .context("Could not parse configuration")
    }
}
