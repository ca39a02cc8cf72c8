//! Persistent application settings (JSON file in the platform data dir).
//!
//! Precedence: environment variables (`SOTTO_*`) > settings file > defaults.
//! Credentials never appear in logs; they are handed to the transport as
//! opaque header values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sotto_core::{CoordinatorConfig, TransportConfig};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub endpoint: String,
    pub app_key: String,
    pub access_key: String,
    pub resource_id: String,
    pub model_name: String,
    /// Name of the push-to-talk key, e.g. "F8" or "RightAlt".
    pub push_to_talk_key: String,
    pub silence_threshold: u32,
    pub silence_window_seconds: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            endpoint: transport.endpoint,
            app_key: String::new(),
            access_key: String::new(),
            resource_id: transport.resource_id,
            model_name: transport.model_name,
            push_to_talk_key: "F8".into(),
            silence_threshold: 500,
            silence_window_seconds: 60,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.push_to_talk_key = self.push_to_talk_key.trim().to_string();
        if self.push_to_talk_key.is_empty() {
            self.push_to_talk_key = "F8".into();
        }
        self.silence_window_seconds = self.silence_window_seconds.clamp(5, 600);
        self.silence_threshold = self.silence_threshold.clamp(50, 10_000);
        if self.endpoint.trim().is_empty() {
            self.endpoint = TransportConfig::default().endpoint;
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            app_key: self.app_key.clone(),
            access_key: self.access_key.clone(),
            resource_id: self.resource_id.clone(),
            model_name: self.model_name.clone(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            silence_threshold: self.silence_threshold,
            silence_window: Duration::from_secs(self.silence_window_seconds),
            ..CoordinatorConfig::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.app_key.is_empty() && !self.access_key.is_empty()
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Sotto")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sotto")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    apply_env_overrides(&mut settings);
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

fn apply_env_overrides(settings: &mut AppSettings) {
    if let Ok(value) = std::env::var("SOTTO_ENDPOINT") {
        settings.endpoint = value;
    }
    if let Ok(value) = std::env::var("SOTTO_APP_KEY") {
        settings.app_key = value;
    }
    if let Ok(value) = std::env::var("SOTTO_ACCESS_KEY") {
        settings.access_key = value;
    }
    if let Ok(value) = std::env::var("SOTTO_RESOURCE_ID") {
        settings.resource_id = value;
    }
    if let Ok(value) = std::env::var("SOTTO_PTT_KEY") {
        settings.push_to_talk_key = value;
    }
}
