use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    OpenAi,
    Cohere,
}

impl AiProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "cohere" => Some(Self::Cohere),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Cohere => "cohere",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DashboardAuthMode {
    #[default]
    Required,
    Disabled,
}

impl DashboardAuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "required" | "basic" | "on" => Some(Self::Required),
            "disabled" | "none" | "off" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Response backend
    #[serde(default)]
    pub ai_provider: AiProvider,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_url")]
    pub openai_api_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default)]
    pub cohere_api_key: Option<String>,
    #[serde(default = "default_cohere_url")]
    pub cohere_api_url: String,
    #[serde(default = "default_cohere_model")]
    pub cohere_model: String,

    // Contacts and storage
    #[serde(default)]
    pub approved_contacts: Vec<String>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_style_path")]
    pub chat_style_path: String,

    // Loop behaviour
    #[serde(default = "default_true")]
    pub auto_reply_enabled: bool,
    #[serde(default = "default_check_interval", alias = "poll_interval_secs")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown_seconds: u64,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub persist_poll_cursors: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_bridge_url")]
    pub transport_bridge_url: String,

    // Dashboard
    #[serde(default = "default_dashboard_host")]
    pub dashboard_host: String,
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,
    #[serde(default = "default_dashboard_username")]
    pub dashboard_username: String,
    #[serde(default)]
    pub dashboard_password: Option<String>,
    #[serde(default)]
    pub dashboard_auth_mode: DashboardAuthMode,
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_cohere_url() -> String {
    "https://api.cohere.ai".to_string()
}

fn default_cohere_model() -> String {
    "command-r".to_string()
}

fn default_database_path() -> String {
    "chat_data/chat_history.db".to_string()
}

fn default_style_path() -> String {
    "chat-style/my_style.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    10
}

fn default_error_cooldown() -> u64 {
    5
}

fn default_context_window() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_dashboard_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dashboard_port() -> u16 {
    5000
}

fn default_dashboard_username() -> String {
    "admin".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ai_provider: AiProvider::default(),
            openai_api_key: None,
            openai_api_url: default_openai_url(),
            openai_model: default_openai_model(),
            cohere_api_key: None,
            cohere_api_url: default_cohere_url(),
            cohere_model: default_cohere_model(),
            approved_contacts: Vec::new(),
            database_path: default_database_path(),
            encryption_key: None,
            chat_style_path: default_style_path(),
            auto_reply_enabled: true,
            check_interval_seconds: default_check_interval(),
            error_cooldown_seconds: default_error_cooldown(),
            context_window: default_context_window(),
            persist_poll_cursors: false,
            request_timeout_seconds: default_request_timeout(),
            transport_bridge_url: default_bridge_url(),
            dashboard_host: default_dashboard_host(),
            dashboard_port: default_dashboard_port(),
            dashboard_username: default_dashboard_username(),
            dashboard_password: None,
            dashboard_auth_mode: DashboardAuthMode::default(),
        }
    }
}

/// Settings the dashboard may show. Keys and passwords are reduced to flags.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConfig {
    pub ai_provider: AiProvider,
    pub model: String,
    pub api_key_configured: bool,
    pub approved_contacts: Vec<String>,
    pub auto_reply_enabled: bool,
    pub check_interval_seconds: u64,
    pub error_cooldown_seconds: u64,
    pub context_window: usize,
    pub persist_poll_cursors: bool,
    pub request_timeout_seconds: u64,
    pub transport_bridge_url: String,
    pub encryption_enabled: bool,
}

impl AppConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `DIGIME_CONFIG` if set, otherwise `digime_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("DIGIME_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("digime_config.toml"),
        }
    }

    /// `.env`, then the TOML file, then environment overrides.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {:?}", path),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("Ignoring unreadable .env: {}", e),
        }

        let path = Self::config_path();
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            tracing::info!("Loaded config from {:?}", path);
            config
        } else {
            tracing::info!("No config file at {:?}, using defaults + env vars", path);
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid digime config")
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get("AI_PROVIDER") {
            match AiProvider::parse(&raw) {
                Some(provider) => self.ai_provider = provider,
                None => tracing::warn!("Unknown AI_PROVIDER '{}', keeping {}", raw, self.ai_provider.as_str()),
            }
        }

        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(url) = get("OPENAI_API_URL") {
            self.openai_api_url = url;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.openai_model = model;
        }
        if let Some(key) = get("COHERE_API_KEY") {
            self.cohere_api_key = Some(key);
        }
        if let Some(url) = get("COHERE_API_URL") {
            self.cohere_api_url = url;
        }
        if let Some(model) = get("COHERE_MODEL") {
            self.cohere_model = model;
        }

        if let Some(list) = get("APPROVED_CONTACTS") {
            self.approved_contacts = list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(path) = get("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(key) = get("ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
        if let Some(path) = get("CHAT_STYLE_PATH") {
            self.chat_style_path = path;
        }

        if let Some(enabled) = get("AUTO_REPLY_ENABLED") {
            self.auto_reply_enabled = parse_flag(&enabled);
        }
        if let Some(seconds) = get("CHECK_INTERVAL_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.check_interval_seconds = seconds;
        }
        if let Some(seconds) = get("ERROR_COOLDOWN_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.error_cooldown_seconds = seconds;
        }
        if let Some(window) = get("CONTEXT_WINDOW").and_then(|v| v.trim().parse().ok()) {
            self.context_window = window;
        }
        if let Some(enabled) = get("PERSIST_POLL_CURSORS") {
            self.persist_poll_cursors = parse_flag(&enabled);
        }
        if let Some(seconds) = get("REQUEST_TIMEOUT_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.request_timeout_seconds = seconds;
        }

        if let Some(url) = get("TRANSPORT_BRIDGE_URL") {
            self.transport_bridge_url = url;
        }

        if let Some(host) = get("DASHBOARD_HOST") {
            self.dashboard_host = host;
        }
        if let Some(port) = get("DASHBOARD_PORT").and_then(|v| v.trim().parse().ok()) {
            self.dashboard_port = port;
        }
        if let Some(user) = get("DASHBOARD_USERNAME") {
            self.dashboard_username = user;
        }
        if let Some(password) = get("DASHBOARD_PASSWORD") {
            self.dashboard_password = Some(password);
        }
        if let Some(raw) = get("DASHBOARD_AUTH_MODE") {
            match DashboardAuthMode::parse(&raw) {
                Some(mode) => self.dashboard_auth_mode = mode,
                None => tracing::warn!("Unknown DASHBOARD_AUTH_MODE '{}', keeping current mode", raw),
            }
        }
    }

    pub fn active_api_key(&self) -> Option<&str> {
        let key = match self.ai_provider {
            AiProvider::OpenAi => self.openai_api_key.as_deref(),
            AiProvider::Cohere => self.cohere_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn active_model(&self) -> &str {
        match self.ai_provider {
            AiProvider::OpenAi => &self.openai_model,
            AiProvider::Cohere => &self.cohere_model,
        }
    }

    /// Every problem with the bot configuration, all at once.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.active_api_key().is_none() {
            let var = match self.ai_provider {
                AiProvider::OpenAi => "OPENAI_API_KEY",
                AiProvider::Cohere => "COHERE_API_KEY",
            };
            errors.push(format!(
                "{} is required when AI_PROVIDER={}",
                var,
                self.ai_provider.as_str()
            ));
        }
        if self.approved_contacts.is_empty() {
            errors.push("APPROVED_CONTACTS must list at least one contact".to_string());
        }
        errors.extend(self.validate_storage());
        if self.check_interval_seconds == 0 {
            errors.push("CHECK_INTERVAL_SECONDS must be greater than zero".to_string());
        }
        if self.request_timeout_seconds == 0 {
            errors.push("REQUEST_TIMEOUT_SECONDS must be greater than zero".to_string());
        }
        if self.context_window == 0 {
            errors.push("CONTEXT_WINDOW must be greater than zero".to_string());
        }

        errors
    }

    pub fn validate_storage(&self) -> Vec<String> {
        if self.encryption_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return vec!["ENCRYPTION_KEY is required; messages are never stored in plaintext".to_string()];
        }
        Vec::new()
    }

    /// Dashboard-only checks (credentials).
    pub fn validate_dashboard(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.dashboard_auth_mode == DashboardAuthMode::Required
            && self.dashboard_password.as_deref().map_or(true, |p| p.is_empty())
        {
            errors.push(
                "DASHBOARD_PASSWORD is required unless DASHBOARD_AUTH_MODE=disabled".to_string(),
            );
        }
        errors
    }

    pub fn public_view(&self) -> PublicConfig {
        PublicConfig {
            ai_provider: self.ai_provider,
            model: self.active_model().to_string(),
            api_key_configured: self.active_api_key().is_some(),
            approved_contacts: self.approved_contacts.clone(),
            auto_reply_enabled: self.auto_reply_enabled,
            check_interval_seconds: self.check_interval_seconds,
            error_cooldown_seconds: self.error_cooldown_seconds,
            context_window: self.context_window,
            persist_poll_cursors: self.persist_poll_cursors,
            request_timeout_seconds: self.request_timeout_seconds,
            transport_bridge_url: self.transport_bridge_url.clone(),
            encryption_enabled: self.encryption_key.is_some(),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1")
        || raw.eq_ignore_ascii_case("true")
        || raw.eq_ignore_ascii_case("yes")
        || raw.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.ai_provider, AiProvider::OpenAi);
        assert_eq!(config.check_interval_seconds, 10);
        assert_eq!(config.error_cooldown_seconds, 5);
        assert_eq!(config.context_window, 10);
        assert!(config.auto_reply_enabled);
        assert!(!config.persist_poll_cursors);
        assert_eq!(config.request_timeout_seconds, 30);
        assert_eq!(config.dashboard_host, "0.0.0.0");
        assert_eq!(config.dashboard_port, 5000);
        assert_eq!(config.database_path, "chat_data/chat_history.db");
        assert_eq!(config.chat_style_path, "chat-style/my_style.json");
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = AppConfig::from_toml("").expect("parse");
        assert_eq!(config.check_interval_seconds, 10);
        assert!(config.auto_reply_enabled);
    }

    #[test]
    fn toml_values_are_read() {
        let config = AppConfig::from_toml(
            r#"
            ai_provider = "cohere"
            approved_contacts = ["+1555", "+1666"]
            auto_reply_enabled = false
            check_interval_seconds = 30
            dashboard_auth_mode = "disabled"
            "#,
        )
        .expect("parse");
        assert_eq!(config.ai_provider, AiProvider::Cohere);
        assert_eq!(config.approved_contacts, vec!["+1555", "+1666"]);
        assert!(!config.auto_reply_enabled);
        assert_eq!(config.check_interval_seconds, 30);
        assert_eq!(config.dashboard_auth_mode, DashboardAuthMode::Disabled);
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_overrides(lookup(&[
            ("AI_PROVIDER", "Cohere"),
            ("COHERE_API_KEY", "ck"),
            ("APPROVED_CONTACTS", " +1555 , ,+1666"),
            ("AUTO_REPLY_ENABLED", "false"),
            ("CHECK_INTERVAL_SECONDS", "not-a-number"),
            ("ERROR_COOLDOWN_SECONDS", "9"),
            ("PERSIST_POLL_CURSORS", "yes"),
            ("REQUEST_TIMEOUT_SECONDS", "12"),
            ("DASHBOARD_PORT", "8081"),
        ]));

        assert_eq!(config.ai_provider, AiProvider::Cohere);
        assert_eq!(config.active_api_key(), Some("ck"));
        assert_eq!(config.approved_contacts, vec!["+1555", "+1666"]);
        assert!(!config.auto_reply_enabled);
        assert_eq!(config.check_interval_seconds, 10);
        assert_eq!(config.error_cooldown_seconds, 9);
        assert!(config.persist_poll_cursors);
        assert_eq!(config.request_timeout_seconds, 12);
        assert_eq!(config.dashboard_port, 8081);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = AppConfig::default();
        config.check_interval_seconds = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("OPENAI_API_KEY")));
        assert!(errors.iter().any(|e| e.contains("APPROVED_CONTACTS")));
        assert!(errors.iter().any(|e| e.contains("ENCRYPTION_KEY")));
        assert!(errors.iter().any(|e| e.contains("CHECK_INTERVAL_SECONDS")));
    }

    #[test]
    fn validate_passes_for_complete_config() {
        let mut config = AppConfig::default();
        config.apply_overrides(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("APPROVED_CONTACTS", "+1555"),
            ("ENCRYPTION_KEY", "secret"),
        ]));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn dashboard_requires_password_unless_disabled() {
        let mut config = AppConfig::default();
        assert_eq!(config.validate_storage().len(), 1);
        config.encryption_key = Some("secret".to_string());
        assert!(config.validate_storage().is_empty());
        assert_eq!(config.validate_dashboard().len(), 1);
        config.dashboard_auth_mode = DashboardAuthMode::Disabled;
        assert!(config.validate_dashboard().is_empty());
    }

    #[test]
    fn public_view_hides_secrets() {
        let mut config = AppConfig::default();
        config.openai_api_key = Some("sk-very-secret".to_string());
        config.encryption_key = Some("hunter2".to_string());
        config.dashboard_password = Some("pw".to_string());

        let json = serde_json::to_string(&config.public_view()).expect("serialize");
        assert!(!json.contains("sk-very-secret"));
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"api_key_configured\":true"));
        assert!(json.contains("\"ai_provider\":\"openai\""));
    }
}
