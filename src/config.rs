use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound the registry accepts for `?limit=` on the detail endpoint.
pub const MAX_DETAIL_METRICS: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub api_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub clipboard: ClipboardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_detail_metrics_limit")]
    pub detail_metrics_limit: usize,
    #[serde(default = "default_manual_refresh_min_visible_ms")]
    pub manual_refresh_min_visible_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_success_display_ms")]
    pub success_display_ms: u64,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClipboardConfig {
    #[serde(default = "default_clipboard_primary")]
    pub primary: Vec<Vec<String>>,
    #[serde(default = "default_clipboard_fallback")]
    pub fallback: Vec<Vec<String>>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            detail_metrics_limit: default_detail_metrics_limit(),
            manual_refresh_min_visible_ms: default_manual_refresh_min_visible_ms(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            success_display_ms: default_success_display_ms(),
            state_file: default_state_file(),
        }
    }
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            primary: default_clipboard_primary(),
            fallback: default_clipboard_fallback(),
        }
    }
}

impl TelemetryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn manual_refresh_min_visible(&self) -> Duration {
        Duration::from_millis(self.manual_refresh_min_visible_ms)
    }
}

impl ProvisioningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn success_display(&self) -> Duration {
        Duration::from_millis(self.success_display_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        let base = self.api_base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Validation(
                "api_base_url должен начинаться с http:// или https://".to_string(),
            ));
        }

        validate_telemetry(&self.telemetry)?;
        validate_provisioning(&self.provisioning)?;
        validate_clipboard(&self.clipboard)?;

        Ok(())
    }

    /// Base URL without a trailing slash, ready for `format!("{base}/vm")`.
    pub fn api_base(&self) -> String {
        self.api_base_url.trim().trim_end_matches('/').to_string()
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_telemetry(cfg: &TelemetryConfig) -> Result<(), ConfigError> {
    if cfg.refresh_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "telemetry.refresh_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if !(1..=MAX_DETAIL_METRICS).contains(&cfg.detail_metrics_limit) {
        return Err(ConfigError::Validation(format!(
            "telemetry.detail_metrics_limit должно быть в диапазоне 1..{MAX_DETAIL_METRICS}"
        )));
    }
    Ok(())
}

fn validate_provisioning(cfg: &ProvisioningConfig) -> Result<(), ConfigError> {
    if cfg.poll_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "provisioning.poll_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.session_ttl_secs < 1 {
        return Err(ConfigError::Validation(
            "provisioning.session_ttl_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.state_file.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "provisioning.state_file не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_clipboard(cfg: &ClipboardConfig) -> Result<(), ConfigError> {
    for (section, commands) in [("primary", &cfg.primary), ("fallback", &cfg.fallback)] {
        for argv in commands {
            if argv.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "clipboard.{section}: команда не должна быть пустой"
                )));
            }
        }
    }
    Ok(())
}

fn default_user_agent() -> String {
    "vmconsole/0.1.0".to_string()
}

const fn default_refresh_interval_secs() -> u64 {
    5
}

const fn default_detail_metrics_limit() -> usize {
    MAX_DETAIL_METRICS
}

const fn default_manual_refresh_min_visible_ms() -> u64 {
    2000
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_session_ttl_secs() -> u64 {
    12 * 60 * 60
}

const fn default_success_display_ms() -> u64 {
    3000
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./pending_vm_setup_v2.json")
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn default_clipboard_primary() -> Vec<Vec<String>> {
    if cfg!(target_os = "macos") {
        vec![argv(&["pbcopy"])]
    } else if cfg!(target_os = "windows") {
        vec![argv(&["clip"])]
    } else {
        vec![argv(&["wl-copy"])]
    }
}

fn default_clipboard_fallback() -> Vec<Vec<String>> {
    vec![
        argv(&["xclip", "-selection", "clipboard"]),
        argv(&["xsel", "--clipboard", "--input"]),
    ]
}
