//! Built-in `settings` service state
//!
//! A small launcher-settings record the daemon registers so the sync protocol
//! can be exercised end to end.

use serde::{Deserialize, Serialize};

use super::model::{Mutation, StateModel};

/// Name the daemon registers this state under
pub const SETTINGS_SERVICE: &str = "settings";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsState {
    pub locale: String,
    pub theme: String,
    /// Maximum JVM heap in MiB
    pub max_memory: u32,
    pub java_paths: Vec<String>,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            theme: "system".to_string(),
            max_memory: 2048,
            java_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SettingsMutation {
    LocaleSet(String),
    ThemeSet(String),
    MaxMemorySet(u32),
    JavaPathAdd(String),
    JavaPathRemove(String),
    Reset,
}

impl Mutation for SettingsMutation {
    fn name(&self) -> &'static str {
        match self {
            SettingsMutation::LocaleSet(_) => "localeSet",
            SettingsMutation::ThemeSet(_) => "themeSet",
            SettingsMutation::MaxMemorySet(_) => "maxMemorySet",
            SettingsMutation::JavaPathAdd(_) => "javaPathAdd",
            SettingsMutation::JavaPathRemove(_) => "javaPathRemove",
            SettingsMutation::Reset => "reset",
        }
    }
}

impl StateModel for SettingsState {
    type Mutation = SettingsMutation;

    fn apply(&mut self, mutation: &SettingsMutation) {
        match mutation {
            SettingsMutation::LocaleSet(locale) => self.locale = locale.clone(),
            SettingsMutation::ThemeSet(theme) => self.theme = theme.clone(),
            SettingsMutation::MaxMemorySet(mb) => self.max_memory = *mb,
            SettingsMutation::JavaPathAdd(path) => {
                if !self.java_paths.contains(path) {
                    self.java_paths.push(path.clone());
                }
            }
            SettingsMutation::JavaPathRemove(path) => self.java_paths.retain(|p| p != path),
            SettingsMutation::Reset => *self = SettingsState::default(),
        }
    }
}
