use anyhow::Result;
use serde::Deserialize;

/// Tunables for the connection and liveness core. Everything except the
/// entry point has a sensible default, and any field can be overridden with
/// a `SWARM_*` environment variable.
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmConfig {
    pub entry_ip: String,
    pub entry_port: u16,

    /// Ceiling on concurrently connected nodes; the sweep opens at most one
    /// new connection per tick while below it.
    #[serde(default = "default_target_connections")]
    pub target_connections: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_entry_retry_ms")]
    pub entry_retry_ms: u64,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_removal_linger_ms")]
    pub removal_linger_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
}

fn default_target_connections() -> usize {
    8
}

fn default_sweep_interval_ms() -> u64 {
    250
}

fn default_entry_retry_ms() -> u64 {
    1000
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_silence_timeout_ms() -> u64 {
    5000
}

fn default_removal_linger_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_coalesce_window_ms() -> u64 {
    100
}

pub fn load_swarm_config(path: &str) -> Result<SwarmConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(std::path::Path::new(path)).required(false))
        .add_source(config::Environment::with_prefix("SWARM"))
        .build()?;
    Ok(settings.try_deserialize()?)
}
