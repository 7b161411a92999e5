use std::{fs, path::Path};

use serde::Deserialize;
use tracing::warn;

use crate::{history::MAX_HISTORY_WINDOW, reconciler::HydrationPolicy};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub room_tag: String,
    pub history_limit: usize,
    pub hydration_policy: HydrationPolicy,
    pub store_url: String,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            room_tag: "BirdNest".into(),
            history_limit: MAX_HISTORY_WINDOW,
            hydration_policy: HydrationPolicy::Merge,
            store_url: "sqlite://./data/session.db".into(),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    room_tag: Option<String>,
    history_limit: Option<usize>,
    hydration_policy: Option<HydrationPolicy>,
    store_url: Option<String>,
    event_buffer: Option<usize>,
}

pub fn load_settings() -> ClientSettings {
    let mut settings = load_settings_from(Path::new(DEFAULT_SETTINGS_FILE));
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

/// Defaults overlaid with the TOML file at `path`, if it exists and parses.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    let file_cfg = match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!("config: ignoring unreadable {}: {err}", path.display());
            return settings;
        }
    };

    if let Some(v) = file_cfg.room_tag {
        settings.room_tag = v;
    }
    if let Some(v) = file_cfg.history_limit {
        settings.history_limit = v;
    }
    if let Some(v) = file_cfg.hydration_policy {
        settings.hydration_policy = v;
    }
    if let Some(v) = file_cfg.store_url {
        settings.store_url = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v;
    }

    settings.normalize();
    settings
}

pub fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__ROOM_TAG") {
        settings.room_tag = v;
    }
    if let Some(v) = var("APP__HISTORY_LIMIT") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.history_limit = parsed;
        }
    }
    if let Some(v) = var("APP__HYDRATION_POLICY") {
        match v.trim().to_ascii_lowercase().as_str() {
            "merge" => settings.hydration_policy = HydrationPolicy::Merge,
            "replace" => settings.hydration_policy = HydrationPolicy::Replace,
            other => warn!("config: unknown hydration policy '{other}'"),
        }
    }
    if let Some(v) = var("APP__STORE_URL") {
        settings.store_url = v;
    }
    if let Some(v) = var("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed;
        }
    }

    settings.normalize();
}

impl ClientSettings {
    fn normalize(&mut self) {
        self.history_limit = self.history_limit.clamp(1, MAX_HISTORY_WINDOW);
        self.event_buffer = self.event_buffer.max(1);
        if self.room_tag.trim().is_empty() {
            self.room_tag = Self::default().room_tag;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
