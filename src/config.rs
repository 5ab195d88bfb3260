use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::hotkey::Hotkey;

const MAX_MODEL_HISTORY: usize = 10;

/// A named preset: where the server lives and which model to start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub name: &'static str,
    pub base_url: &'static str,
    pub default_model: &'static str,
}

pub const PROFILES: &[Profile] = &[
    Profile { name: "Local", base_url: "http://localhost:8000/v1", default_model: "HY-MT1.5-1.8B" },
    Profile { name: "Ollama", base_url: "http://localhost:11434/v1", default_model: "qwen2.5:3b" },
    Profile { name: "OpenAI", base_url: "https://api.openai.com/v1", default_model: "gpt-4o-mini" },
];

pub const OLLAMA_PROFILE: &str = "Ollama";

impl Profile {
    pub fn find(name: &str) -> Option<&'static Profile> {
        PROFILES.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub active_profile: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub source_lang: String,
    pub target_lang: String,
    pub hotkey: String,
    pub stream: bool,
    pub restore_clipboard: bool,
    pub model_history: BTreeMap<String, Vec<String>>,
    /// Keys this version does not know about, written back unchanged and in file order.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let local = &PROFILES[0];
        Self {
            active_profile: local.name.to_string(),
            base_url: local.base_url.to_string(),
            model: local.default_model.to_string(),
            api_key: String::new(),
            source_lang: "English".to_string(),
            target_lang: "Russian".to_string(),
            hotkey: "ctrl+alt+t".to_string(),
            stream: true,
            restore_clipboard: false,
            model_history: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl Settings {
    pub fn path() -> PathBuf {
        crate::logger::exe_dir().join("settings.json")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Missing keys take their defaults; an unreadable or malformed file yields full defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => match serde_json::from_str::<Settings>(&s) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Settings file {} is invalid ({}); using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("No settings file at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Pretty JSON with a 4-space indent and a trailing newline.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn apply_env_overrides(&mut self) {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if let Some(v) = read("TRANSLATOR_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = read("TRANSLATOR_MODEL") {
            self.model = v;
        }
        if let Some(v) = read("TRANSLATOR_API_KEY") {
            self.api_key = v;
        }
    }

    /// Points base URL and model at the profile's stored defaults. Histories are left alone.
    pub fn switch_profile(&mut self, name: &str) -> bool {
        let Some(profile) = Profile::find(name) else {
            log::warn!("Unknown profile '{}'", name);
            return false;
        };
        self.active_profile = profile.name.to_string();
        self.base_url = profile.base_url.to_string();
        self.model = self
            .model_history
            .get(profile.name)
            .and_then(|h| h.first().cloned())
            .unwrap_or_else(|| profile.default_model.to_string());
        true
    }

    pub fn remember_model(&mut self) {
        let model = self.model.trim().to_string();
        if model.is_empty() {
            return;
        }
        let history = self.model_history.entry(self.active_profile.clone()).or_default();
        history.retain(|m| *m != model);
        history.insert(0, model);
        history.truncate(MAX_MODEL_HISTORY);
    }

    pub fn models_for_active(&self) -> &[String] {
        self.model_history
            .get(&self.active_profile)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_ollama(&self) -> bool {
        self.active_profile == OLLAMA_PROFILE
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err("Base URL cannot be empty.".to_string());
        }
        if self.model.trim().is_empty() {
            return Err("Model ID cannot be empty.".to_string());
        }
        Hotkey::parse(&self.hotkey).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FIXED: &str = r#"{
    "active_profile": "Ollama",
    "base_url": "http://localhost:11434/v1",
    "model": "llama3.2:3b",
    "api_key": "",
    "source_lang": "English",
    "target_lang": "Português",
    "hotkey": "ctrl+shift+y",
    "stream": false,
    "restore_clipboard": true,
    "model_history": {
        "Local": [
            "HY-MT1.5-1.8B"
        ],
        "Ollama": [
            "llama3.2:3b",
            "qwen2.5:3b"
        ]
    }
}
"#;

    #[test]
    fn load_then_save_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, FIXED).unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.target_lang, "Português");
        settings.save_to(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), FIXED);
    }

    #[test]
    fn unknown_keys_survive_a_save() {
        let fixture = FIXED.replace(
            "\n    }\n}\n",
            "\n    },\n    \"ui_theme\": \"dark\",\n    \"window\": {\n        \"x\": 10,\n        \"y\": 20\n    }\n}\n",
        );
        assert!(fixture.contains("\"ui_theme\": \"dark\""));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, &fixture).unwrap();

        let mut settings = Settings::load_from(&path);
        assert_eq!(settings.extra.keys().collect::<Vec<_>>(), vec!["ui_theme", "window"]);
        settings.save_to(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), fixture);

        settings.model = "qwen2.5:7b".to_string();
        settings.remember_model();
        settings.save_to(&path).unwrap();
        let reloaded = Settings::load_from(&path);
        assert_eq!(reloaded.extra["ui_theme"], "dark");
        assert_eq!(reloaded.extra["window"]["y"], 20);
        assert_eq!(reloaded.model, "qwen2.5:7b");
    }

    #[test]
    fn defaults_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        Settings::default().save_to(&path).unwrap();
        let first = fs::read(&path).unwrap();

        Settings::load_from(&path).save_to(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.json"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn invalid_json_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn partial_file_fills_missing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"base_url": "http://10.0.0.2:8000/v1", "model": "m", "source_lang": "English",
                "target_lang": "German", "hotkey": "ctrl+alt+g"}"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.base_url, "http://10.0.0.2:8000/v1");
        assert_eq!(settings.target_lang, "German");
        assert_eq!(settings.active_profile, "Local");
        assert!(settings.stream);
        assert!(settings.model_history.is_empty());
    }

    #[test]
    fn switching_profile_uses_its_defaults_and_keeps_histories() {
        let mut settings = Settings::default();
        settings.model = "HY-MT1.5-7B".to_string();
        settings.remember_model();
        settings
            .model_history
            .insert("OpenAI".to_string(), vec!["gpt-4.1-mini".to_string(), "gpt-4o".to_string()]);
        let before = settings.model_history.clone();

        assert!(settings.switch_profile("Ollama"));
        assert_eq!(settings.active_profile, "Ollama");
        assert_eq!(settings.base_url, "http://localhost:11434/v1");
        assert_eq!(settings.model, "qwen2.5:3b");
        assert_eq!(settings.model_history, before);

        assert!(settings.switch_profile("OpenAI"));
        assert_eq!(settings.base_url, "https://api.openai.com/v1");
        assert_eq!(settings.model, "gpt-4.1-mini");

        assert!(settings.switch_profile("Local"));
        assert_eq!(settings.model, "HY-MT1.5-7B");
        assert_eq!(settings.model_history, before);
    }

    #[test]
    fn unknown_profile_changes_nothing() {
        let mut settings = Settings::default();
        let before = settings.clone();
        assert!(!settings.switch_profile("Nope"));
        assert_eq!(settings, before);
    }

    #[test]
    fn remember_model_dedupes_and_caps() {
        let mut settings = Settings::default();
        for i in 0..12 {
            settings.model = format!("m{}", i);
            settings.remember_model();
        }
        settings.model = "m5".to_string();
        settings.remember_model();

        let history = settings.models_for_active();
        assert_eq!(history.len(), MAX_MODEL_HISTORY);
        assert_eq!(history[0], "m5");
        assert_eq!(history.iter().filter(|m| *m == "m5").count(), 1);
        assert_eq!(history[1], "m11");
    }

    #[test]
    fn validate_rejects_empty_fields_and_bad_hotkeys() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.model = "  ".to_string();
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.hotkey = "ctrl+alt".to_string();
        assert!(settings.validate().is_err());
    }
}
