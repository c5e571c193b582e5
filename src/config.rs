use crate::scheduler::DailySchedule;
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::info;

pub const CHAT_WEBHOOK_ENV: &str = "CHAT_WEBHOOK_URL";
pub const GOOGLE_CREDENTIALS_ENV: &str = "GOOGLE_CREDENTIALS_PATH";
pub const LOG_FILE_ENV: &str = "LOG_FILE";

/// Largest accepted webhook body limit, in MiB.
pub const MAX_BODY_MB: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write logs here, rotated daily; stdout only when unset.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Rotated log files kept next to `log_file`.
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub chat: ChatSection,
}

fn default_db_path() -> String {
    "data/records.db".to_string()
}

fn default_reports_dir() -> String {
    "reports".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_files() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request body limit for the webhook, in MiB.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_mb() -> usize {
    25
}

impl ServerSection {
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    /// Local wall-clock time of the daily run, `HH:MM`.
    #[serde(default = "default_validation_time")]
    pub validation_time: String,
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_validation_time() -> String {
    "09:30".to_string()
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            validation_time: default_validation_time(),
            utc_offset: default_utc_offset(),
            enabled: true,
        }
    }
}

impl ScheduleSection {
    pub fn daily(&self) -> Result<DailySchedule, ConfigError> {
        DailySchedule::parse(&self.validation_time, &self.utc_offset)
    }
}

/// How invoice fields are pulled out of the PDF.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionBackend {
    /// Upload the PDF and let an assistant read it with file search.
    #[default]
    Assistants,
    /// Extract PDF text locally and send it to chat completions.
    Chat,
    /// Local regex heuristics only, no LLM.
    Heuristics,
}

/// How extracted invoices are matched against purchase orders.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonBackend {
    #[default]
    Llm,
    /// Local amount matching, no LLM.
    Amounts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub extraction: ExtractionBackend,
    #[serde(default)]
    pub comparison: ComparisonBackend,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_extraction_timeout_secs() -> u64 {
    90
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            extraction: ExtractionBackend::default(),
            comparison: ComparisonBackend::default(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Drive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_local_dir")]
    pub local_dir: String,
    #[serde(default)]
    pub reports_folder_id: Option<String>,
    #[serde(default)]
    pub invoices_folder_id: Option<String>,
    /// Service-account key file; takes precedence over the refresh token.
    #[serde(default)]
    pub service_account_key: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Environment variable holding a user's OAuth refresh token.
    #[serde(default = "default_refresh_token_env")]
    pub refresh_token_env: String,
}

fn default_local_dir() -> String {
    "published".to_string()
}

fn default_refresh_token_env() -> String {
    "DRIVE_REFRESH_TOKEN".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_dir: default_local_dir(),
            reports_folder_id: None,
            invoices_folder_id: None,
            service_account_key: None,
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token_env: default_refresh_token_env(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatSection {
    /// Incoming-webhook URL; without one, notifications are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reports_dir: default_reports_dir(),
            log_level: default_log_level(),
            log_file: None,
            log_max_files: default_log_max_files(),
            server: ServerSection::default(),
            schedule: ScheduleSection::default(),
            llm: LlmSection::default(),
            storage: StorageSection::default(),
            chat: ChatSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "No config file, using defaults");
            let config = Self::default().with_env(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        let config = config.with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides, looked up through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(CHAT_WEBHOOK_ENV).filter(|u| !u.trim().is_empty()) {
            self.chat.webhook_url = Some(url);
        }
        if let Some(path) = lookup(GOOGLE_CREDENTIALS_ENV).filter(|p| !p.trim().is_empty()) {
            self.storage.service_account_key = Some(path);
        }
        if let Some(path) = lookup(LOG_FILE_ENV).filter(|p| !p.trim().is_empty()) {
            self.log_file = Some(path);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.daily()?;
        if self.server.max_body_mb == 0 || self.server.max_body_mb > MAX_BODY_MB {
            return Err(ConfigError::Invalid {
                key: "server.max_body_mb",
                reason: format!("must be between 1 and {MAX_BODY_MB}"),
            });
        }
        if self.log_file.is_some() && self.log_max_files == 0 {
            return Err(ConfigError::Invalid {
                key: "log_max_files",
                reason: "must be positive".to_string(),
            });
        }
        if self.llm.poll_interval_ms == 0 || self.llm.extraction_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "llm",
                reason: "poll interval and extraction timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}
