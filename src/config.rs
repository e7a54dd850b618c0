use crate::engine::{FetchPolicy, RegistryConfig, StopMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_root_path() -> String {
    "data".to_string()
}
fn default_max_file_num() -> usize {
    128
}
fn default_max_workers_per_file() -> usize {
    32
}
fn default_max_mem_per_task_mb() -> u64 {
    32
}
fn default_schedule_every_millis() -> u64 {
    1000
}
fn default_jobs_per_tick() -> usize {
    1
}
fn default_fail_ceiling() -> u32 {
    10
}
fn default_fail_window_secs() -> u64 {
    60
}
fn default_max_block_failures() -> u32 {
    // 0 = retry forever.
    0
}
fn default_stop_mode() -> StopMode {
    StopMode::Immediate
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    80
}
fn default_bt_port() -> u16 {
    8088
}
fn default_tracker_enabled() -> bool {
    true
}
fn default_tracker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_tracker_port() -> u16 {
    30081
}
fn default_announce_every_secs() -> u64 {
    30
}
fn default_tracker_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub node: NodeConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub bt: BtConfig,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    /// Empty means "generate on first run".
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(default = "default_max_file_num")]
    pub max_file_num: usize,
    #[serde(default = "default_max_workers_per_file")]
    pub max_workers_per_file: usize,
    #[serde(default = "default_max_mem_per_task_mb")]
    pub max_mem_per_task_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_schedule_every_millis")]
    pub schedule_every_millis: u64,
    #[serde(default = "default_jobs_per_tick")]
    pub jobs_per_tick: usize,
    #[serde(default = "default_fail_ceiling")]
    pub fail_ceiling: u32,
    #[serde(default = "default_fail_window_secs")]
    pub fail_window_secs: u64,
    #[serde(default = "default_max_block_failures")]
    pub max_block_failures: u32,
    #[serde(default = "default_stop_mode")]
    pub stop_mode: StopMode,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_bt_port")]
    pub port: u16,
    /// `host:port` of peers to ask for blocks in addition to tracker peers.
    pub seed_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tracker_host")]
    pub host: String,
    #[serde(default = "default_tracker_port")]
    pub port: u16,
    #[serde(default = "default_announce_every_secs")]
    pub announce_every_secs: u64,
    #[serde(default = "default_tracker_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            root_path: default_root_path(),
            peer_id: String::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_file_num: default_max_file_num(),
            max_workers_per_file: default_max_workers_per_file(),
            max_mem_per_task_mb: default_max_mem_per_task_mb(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_every_millis: default_schedule_every_millis(),
            jobs_per_tick: default_jobs_per_tick(),
            fail_ceiling: default_fail_ceiling(),
            fail_window_secs: default_fail_window_secs(),
            max_block_failures: default_max_block_failures(),
            stop_mode: default_stop_mode(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_api_port(),
        }
    }
}

impl Default for BtConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_bt_port(),
            seed_peers: Vec::new(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: default_tracker_enabled(),
            host: default_tracker_host(),
            port: default_tracker_port(),
            announce_every_secs: default_announce_every_secs(),
            timeout_secs: default_tracker_timeout_secs(),
        }
    }
}

impl Config {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.general.root_path)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        let e = &self.engine;
        FetchPolicy {
            schedule_every: Duration::from_millis(e.schedule_every_millis.max(1)),
            jobs_per_tick: e.jobs_per_tick.max(1),
            fail_ceiling: e.fail_ceiling.max(1),
            fail_window: Duration::from_secs(e.fail_window_secs),
            max_block_failures: (e.max_block_failures > 0).then_some(e.max_block_failures),
            stop_mode: e.stop_mode,
            max_mem_per_task: self.node.max_mem_per_task_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            root: self.root_path(),
            max_file_num: self.node.max_file_num,
            max_workers_per_file: self.node.max_workers_per_file.max(1),
            policy: self.fetch_policy(),
        }
    }
}

pub fn init_tracing(config: &Config) {
    // RUST_LOG wins over general.log_level, e.g. RUST_LOG=info,swarm_node::engine=debug
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.general.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .try_init();
}
