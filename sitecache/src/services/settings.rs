//! Settings service
//!
//! Manages client settings persistence using JSON file storage.

use crate::config::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_LOG_FILTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_REFRESH_FREQUENCY, SETTINGS_FILE, WEATHER_FRESHNESS, WEATHER_RETENTION,
};
use crate::error::{AppError, Result};
use crate::services::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Hosted backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Project URL, e.g. "https://abc.supabase.co"
    #[serde(default)]
    pub url: String,
    /// Public anon key sent as `apikey`
    #[serde(default)]
    pub anon_key: String,
    #[serde(default = "default_true")]
    pub realtime_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            realtime_enabled: default_true(),
        }
    }
}

/// Weather cache windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSettings {
    #[serde(default = "default_freshness_minutes")]
    pub freshness_minutes: u64,
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    /// Background refresh frequency: "15m", "1h", ...
    #[serde(default = "default_refresh_frequency")]
    pub refresh_frequency: String,
}

fn default_freshness_minutes() -> u64 {
    WEATHER_FRESHNESS.as_secs() / 60
}

fn default_retention_minutes() -> u64 {
    WEATHER_RETENTION.as_secs() / 60
}

fn default_refresh_frequency() -> String {
    DEFAULT_REFRESH_FREQUENCY.to_string()
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            freshness_minutes: default_freshness_minutes(),
            retention_minutes: default_retention_minutes(),
            refresh_frequency: default_refresh_frequency(),
        }
    }
}

impl WeatherSettings {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_minutes * 60)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.max(1) * 60)
    }
}

/// Retry policy for provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientSettings {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub weather: WeatherSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Service for managing client settings
#[derive(Clone)]
pub struct SettingsService {
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            settings_path: app_data_dir.join(SETTINGS_FILE),
        }
    }

    /// Load settings from disk or create default if not exists
    pub async fn load(&self) -> Result<ClientSettings> {
        if !self.settings_path.exists() {
            tracing::info!("Settings file not found, creating default settings");
            let default = ClientSettings::default();
            self.save(&default).await?;
            return Ok(default);
        }

        let content = fs::read_to_string(&self.settings_path).await?;
        let settings: ClientSettings = serde_json::from_str(&content)
            .map_err(|e| AppError::Generic(format!("Failed to parse settings: {}", e)))?;

        Ok(settings)
    }

    /// Save settings to disk
    pub async fn save(&self, settings: &ClientSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| AppError::Generic(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.settings_path, content).await?;
        tracing::info!("Settings saved to {:?}", self.settings_path);

        Ok(())
    }

    pub async fn get_backend(&self) -> Result<BackendSettings> {
        Ok(self.load().await?.backend)
    }

    pub async fn update_backend(&self, backend: BackendSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.backend = backend;
        self.save(&settings).await
    }

    pub async fn get_weather(&self) -> Result<WeatherSettings> {
        Ok(self.load().await?.weather)
    }

    pub async fn update_weather(&self, weather: WeatherSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.weather = weather;
        self.save(&settings).await
    }
}
