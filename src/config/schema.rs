use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory (`~/.relaygate`) - computed, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Accounts started when the daemon boots.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root directory holding one session directory per instance
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// First debug port handed out; later instances count up from here
    #[serde(default = "default_debug_port_base")]
    pub debug_port_base: u16,
    /// Pause between teardown and re-creation on restart
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
    /// How often the daemon rewrites its state file
    #[serde(default = "default_state_flush_secs")]
    pub state_flush_secs: u64,
}

fn default_sessions_dir() -> PathBuf {
    default_data_dir().join("sessions")
}

fn default_debug_port_base() -> u16 {
    9222
}

fn default_restart_settle_secs() -> u64 {
    2
}

fn default_state_flush_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            debug_port_base: default_debug_port_base(),
            restart_settle_secs: default_restart_settle_secs(),
            state_flush_secs: default_state_flush_secs(),
        }
    }
}

// ── Instances ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable logical key, usually the account phone number
    pub identity: String,
    /// Explicit session directory (defaults to `<sessions_dir>/<identity>`)
    #[serde(default)]
    pub session_path: Option<PathBuf>,
    /// Where hand-off notices and pairing codes are delivered
    #[serde(default)]
    pub admin_address: Option<String>,
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bridge executable started once per instance
    #[serde(default = "default_transport_command")]
    pub command: String,
    #[serde(default = "default_transport_args")]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_transport_command() -> String {
    "node".into()
}

fn default_transport_args() -> Vec<String> {
    vec!["bridge.js".into()]
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: default_transport_command(),
            args: default_transport_args(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

// ── Status heuristics ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Delay before re-initializing after a disconnect
    #[serde(default = "default_disconnect_backoff_secs")]
    pub disconnect_backoff_secs: u64,
    /// Time allowed between `authenticated` and `ready` before polling
    #[serde(default = "default_ready_grace_secs")]
    pub ready_grace_secs: u64,
    #[serde(default = "default_ready_poll_interval_secs")]
    pub ready_poll_interval_secs: u64,
    #[serde(default = "default_ready_poll_attempts")]
    pub ready_poll_attempts: u32,
    /// Completed loading-progress reports needed before forcing `ready`
    #[serde(default = "default_loading_complete_threshold")]
    pub loading_complete_threshold: u32,
    #[serde(default = "default_loading_confirm_delay_secs")]
    pub loading_confirm_delay_secs: u64,
}

fn default_disconnect_backoff_secs() -> u64 {
    5
}

fn default_ready_grace_secs() -> u64 {
    15
}

fn default_ready_poll_interval_secs() -> u64 {
    5
}

fn default_ready_poll_attempts() -> u32 {
    6
}

fn default_loading_complete_threshold() -> u32 {
    2
}

fn default_loading_confirm_delay_secs() -> u64 {
    5
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            disconnect_backoff_secs: default_disconnect_backoff_secs(),
            ready_grace_secs: default_ready_grace_secs(),
            ready_poll_interval_secs: default_ready_poll_interval_secs(),
            ready_poll_attempts: default_ready_poll_attempts(),
            loading_complete_threshold: default_loading_complete_threshold(),
            loading_confirm_delay_secs: default_loading_confirm_delay_secs(),
        }
    }
}

// ── Deduplication ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// "sqlite" (persisted) or "memory" (lost on restart)
    #[serde(default = "default_dedup_backend")]
    pub backend: String,
    #[serde(default = "default_dedup_db_path")]
    pub db_path: PathBuf,
    /// Lifetime of a persisted deduplication record
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_local_cache_ttl_secs")]
    pub local_cache_ttl_secs: u64,
    #[serde(default = "default_local_cache_capacity")]
    pub local_cache_capacity: usize,
}

fn default_dedup_backend() -> String {
    "sqlite".into()
}

fn default_dedup_db_path() -> PathBuf {
    default_data_dir().join("dedup.db")
}

fn default_dedup_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_local_cache_ttl_secs() -> u64 {
    300
}

fn default_local_cache_capacity() -> usize {
    10_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            backend: default_dedup_backend(),
            db_path: default_dedup_db_path(),
            ttl_secs: default_dedup_ttl_secs(),
            local_cache_ttl_secs: default_local_cache_ttl_secs(),
            local_cache_capacity: default_local_cache_capacity(),
        }
    }
}

// ── Hot reconnect ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Window for the candidate's first `qr` or `ready`
    #[serde(default = "default_handoff_timeout_secs")]
    pub handoff_timeout_secs: u64,
    /// Window for a human to scan a delivered pairing code
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_stabilization_delay_secs")]
    pub stabilization_delay_secs: u64,
    /// Delay before the replaced client is destroyed
    #[serde(default = "default_old_client_grace_secs")]
    pub old_client_grace_secs: u64,
    /// Refreshed pairing codes forwarded before the rest are dropped
    #[serde(default = "default_max_qr_forwards")]
    pub max_qr_forwards: u32,
}

fn default_handoff_timeout_secs() -> u64 {
    60
}

fn default_scan_timeout_secs() -> u64 {
    120
}

fn default_stabilization_delay_secs() -> u64 {
    3
}

fn default_old_client_grace_secs() -> u64 {
    10
}

fn default_max_qr_forwards() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            handoff_timeout_secs: default_handoff_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            stabilization_delay_secs: default_stabilization_delay_secs(),
            old_client_grace_secs: default_old_client_grace_secs(),
            max_qr_forwards: default_max_qr_forwards(),
        }
    }
}

// ── Processor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Endpoint receiving each accepted inbound message as JSON
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_processor_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_processor_timeout_secs() -> u64 {
    30
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_processor_timeout_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
        .join(".relaygate")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            config_path: data_dir.join("config.toml"),
            data_dir,
            gateway: GatewayConfig::default(),
            instances: Vec::new(),
            transport: TransportConfig::default(),
            status: StatusConfig::default(),
            dedup: DedupConfig::default(),
            reconnect: ReconnectConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let data_dir = home.join(".relaygate");
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).context("Failed to create .relaygate directory")?;
        }
        Self::load_from(&data_dir.join("config.toml"))
    }

    /// Load `config_path`, writing defaults there first if it does not exist.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let data_dir = config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let mut config = Config::default();
            config.config_path = config_path.to_path_buf();
            config.save()?;
            config
        };

        config.config_path = config_path.to_path_buf();
        config.data_dir = data_dir;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RELAYGATE_SESSIONS_DIR") {
            if !dir.is_empty() {
                self.gateway.sessions_dir = PathBuf::from(dir);
            }
        }

        if let Ok(db) = std::env::var("RELAYGATE_DEDUP_DB") {
            if !db.is_empty() {
                self.dedup.db_path = PathBuf::from(db);
            }
        }

        if let Ok(url) = std::env::var("RELAYGATE_PROCESSOR_URL") {
            if !url.is_empty() {
                self.processor.webhook_url = Some(url);
            }
        }

        if let Ok(command) = std::env::var("RELAYGATE_BRIDGE_COMMAND") {
            if !command.is_empty() {
                self.transport.command = command;
            }
        }
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            let identity = instance.identity.trim();
            if identity.is_empty() {
                anyhow::bail!("instances: identity must not be empty");
            }
            if !seen.insert(identity.to_string()) {
                anyhow::bail!("instances: identity '{identity}' is listed twice");
            }
        }
        match self.dedup.backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!("dedup.backend: unknown backend '{other}'"),
        }
        Ok(())
    }

    /// Daemon state snapshot written next to the config file.
    pub fn state_file_path(&self) -> PathBuf {
        self.data_dir.join("daemon_state.json")
    }

    /// JSON-lines journal of lifecycle events appended by the daemon.
    pub fn events_file_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
