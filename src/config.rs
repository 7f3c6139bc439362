use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Tag name -> usernames mentioned when someone writes `@tag`.
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
        }
    }
}

fn default_bot_name() -> String {
    "herald".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Optional here; `--token` / `BOT_TOKEN` take precedence.
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_api_base(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            db_file: default_db_file(),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        expand_tilde(&self.base_dir.to_string_lossy()).join(&self.db_file)
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".birthday-herald")
}

fn default_db_file() -> String {
    "birthdays.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,
    /// Ledger cleanup runs on the first tick within this many minutes
    /// after midnight.
    #[serde(default = "default_cleanup_window")]
    pub cleanup_window_minutes: u32,
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            retention_days: default_retention_days(),
            warmup_secs: default_warmup(),
            cleanup_window_minutes: default_cleanup_window(),
            send_delay_ms: default_send_delay(),
        }
    }
}

impl ReminderConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    /// Never less than one day, so same-day entries always survive cleanup.
    pub fn retention_days(&self) -> u64 {
        u64::from(self.retention_days.max(1))
    }
}

fn default_check_interval() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    3
}

fn default_warmup() -> u64 {
    10
}

fn default_cleanup_window() -> u32 {
    5
}

fn default_send_delay() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_api_bind(),
            api_key: None,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:3000".to_string()
}

pub fn load(path: &str) -> Result<Config> {
    let path = expand_tilde(path);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config.toml")?;
    let reminders = &config.reminders;
    if u64::from(reminders.cleanup_window_minutes) * 60 < reminders.check_interval_secs {
        tracing::warn!(
            "Cleanup window ({} min) is shorter than the check interval ({}s); \
             some days may skip ledger cleanup",
            reminders.cleanup_window_minutes,
            reminders.check_interval_secs
        );
    }
    Ok(config)
}

pub async fn init_config_dir() -> Result<PathBuf> {
    let base = default_base_dir();
    tokio::fs::create_dir_all(&base).await?;

    let config_path = base.join("config.toml");
    if !config_path.exists() {
        tokio::fs::write(&config_path, DEFAULT_CONFIG).await?;
    }
    Ok(config_path)
}

const DEFAULT_CONFIG: &str = r#"[bot]
name = "herald"

[telegram]
# bot_token = "123456:ABC..."   # or pass --token / set BOT_TOKEN
poll_timeout_secs = 30

[storage]
db_file = "birthdays.db"

[reminders]
check_interval_secs = 300
retention_days = 3
warmup_secs = 10
cleanup_window_minutes = 5
send_delay_ms = 100

[api]
enabled = false
bind = "127.0.0.1:3000"
# api_key = "change-me"

# Writing @team in a chat mentions everyone listed here.
[tags]
# team = ["alice", "bob"]
# coaches = ["carol"]
"#;

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
