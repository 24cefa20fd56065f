use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::ContextType;

pub const DEFAULT_PORT: u16 = 8015;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Hard cap on inbound query length (bytes). Longer queries are `Invalid`.
pub const MAX_QUERY_BYTES: usize = 8 * 1024;

/// Top-level config (maia.toml + MAIA_* env overrides + canonical env names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaiaConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub experts: ExpertsConfig,
    #[serde(default)]
    pub episodes: EpisodeConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path or URL. Required.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Base URL of the Auth collaborator. Required unless local_dev_mode.
    pub service_url: Option<String>,
    /// When true, requests without a valid session fall back to the single
    /// `default` user instead of 401.
    #[serde(default)]
    pub local_dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub primary_endpoint: String,
    #[serde(default)]
    pub fallback_endpoints: Vec<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Models the gateway will accept in requests. The default model is
    /// always considered a member.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: default_llm_endpoint(),
            fallback_endpoints: Vec::new(),
            default_model: default_model(),
            models: Vec::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertsConfig {
    /// Overall dispatch deadline across all selected experts.
    #[serde(default = "default_parallel_deadline_ms")]
    pub parallel_deadline_ms: u64,
    /// Per-expert sub-deadline.
    #[serde(default = "default_expert_deadline_ms")]
    pub expert_deadline_ms: u64,
}

impl Default for ExpertsConfig {
    fn default() -> Self {
        Self {
            parallel_deadline_ms: default_parallel_deadline_ms(),
            expert_deadline_ms: default_expert_deadline_ms(),
        }
    }
}

/// Idle timeouts (minutes) per context type before an episode rotates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeConfig {
    #[serde(default = "default_timeout_chat")]
    pub timeout_minutes_chat: i64,
    #[serde(default = "default_timeout_dev")]
    pub timeout_minutes_development: i64,
    #[serde(default = "default_timeout_plan")]
    pub timeout_minutes_planning: i64,
    #[serde(default = "default_timeout_chat")]
    pub timeout_minutes_general: i64,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            timeout_minutes_chat: default_timeout_chat(),
            timeout_minutes_development: default_timeout_dev(),
            timeout_minutes_planning: default_timeout_plan(),
            timeout_minutes_general: default_timeout_chat(),
        }
    }
}

impl EpisodeConfig {
    pub fn timeout_minutes(&self, context: ContextType) -> i64 {
        match context {
            ContextType::Chat => self.timeout_minutes_chat,
            ContextType::Development => self.timeout_minutes_development,
            ContextType::Planning => self.timeout_minutes_planning,
            ContextType::General => self.timeout_minutes_general,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failures")]
    pub failures: u32,
    #[serde(default = "default_breaker_cooldown_sec")]
    pub cooldown_sec: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failures: default_breaker_failures(),
            cooldown_sec: default_breaker_cooldown_sec(),
        }
    }
}

/// Base URLs for the sibling CRUD routers consumed by experts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Single host serving the lists/calendar/reminders/journal routers.
    #[serde(default = "default_services_base")]
    pub base_url: String,
    /// Home-Assistant bridge; defaults to the shared base.
    pub homeassistant_url: Option<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            base_url: default_services_base(),
            homeassistant_url: None,
        }
    }
}

impl ServicesConfig {
    pub fn homeassistant(&self) -> &str {
        self.homeassistant_url.as_deref().unwrap_or(&self.base_url)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.2:3b".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_parallel_deadline_ms() -> u64 {
    10_000
}
fn default_expert_deadline_ms() -> u64 {
    8_000
}
fn default_timeout_chat() -> i64 {
    30
}
fn default_timeout_dev() -> i64 {
    120
}
fn default_timeout_plan() -> i64 {
    60
}
fn default_breaker_failures() -> u32 {
    5
}
fn default_breaker_cooldown_sec() -> u64 {
    30
}
fn default_services_base() -> String {
    "http://127.0.0.1:8010".to_string()
}

impl MaiaConfig {
    /// Load config from a TOML file with MAIA_* env overrides, then apply the
    /// canonical environment names (DATABASE_URL, LLM_PRIMARY_ENDPOINT, ...).
    pub fn load(config_path: Option<&str>) -> Result<Self, ErrorKind> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut figment = Figment::new();
        if std::path::Path::new(&path).exists() {
            figment = figment.merge(Toml::file(&path));
        }

        // Make `database.url` satisfiable from env alone: the canonical
        // DATABASE_URL is applied below, so seed a placeholder when neither
        // the TOML file nor MAIA_DATABASE__URL provides one.
        let mut config: MaiaConfig = figment
            .merge(Env::prefixed("MAIA_").split("__"))
            .join(figment::providers::Serialized::default(
                "database.url",
                String::new(),
            ))
            .extract()
            .map_err(|e| ErrorKind::Invalid(format!("config: {e}")))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Canonical environment names take precedence over the TOML file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("LLM_PRIMARY_ENDPOINT") {
            self.llm.primary_endpoint = v;
        }
        if let Ok(v) = std::env::var("LLM_FALLBACK_ENDPOINTS") {
            self.llm.fallback_endpoints = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("LLM_DEFAULT_MODEL") {
            self.llm.default_model = v;
        }
        if let Ok(v) = std::env::var("AUTH_SERVICE_URL") {
            self.auth.service_url = Some(v);
        }
        if let Ok(v) = std::env::var("EXPERT_PARALLEL_DEADLINE_MS") {
            if let Ok(ms) = v.parse() {
                self.experts.parallel_deadline_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_FAILURES") {
            if let Ok(n) = v.parse() {
                self.breaker.failures = n;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_COOLDOWN_SEC") {
            if let Ok(s) = v.parse() {
                self.breaker.cooldown_sec = s;
            }
        }
        if let Ok(v) = std::env::var("LOCAL_DEV_MODE") {
            self.auth.local_dev_mode = v == "true" || v == "1";
        }
        for (var, ctx) in [
            ("EPISODE_TIMEOUT_MINUTES_CHAT", ContextType::Chat),
            ("EPISODE_TIMEOUT_MINUTES_DEV", ContextType::Development),
            ("EPISODE_TIMEOUT_MINUTES_PLAN", ContextType::Planning),
            ("EPISODE_TIMEOUT_MINUTES_GENERAL", ContextType::General),
        ] {
            if let Ok(v) = std::env::var(var) {
                if let Ok(mins) = v.parse() {
                    match ctx {
                        ContextType::Chat => self.episodes.timeout_minutes_chat = mins,
                        ContextType::Development => {
                            self.episodes.timeout_minutes_development = mins
                        }
                        ContextType::Planning => self.episodes.timeout_minutes_planning = mins,
                        ContextType::General => self.episodes.timeout_minutes_general = mins,
                    }
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ErrorKind> {
        if self.database.url.is_empty() {
            return Err(ErrorKind::Invalid(
                "config: database.url (DATABASE_URL) is required".to_string(),
            ));
        }
        if !self.auth.local_dev_mode && self.auth.service_url.is_none() {
            return Err(ErrorKind::Invalid(
                "config: auth.service_url (AUTH_SERVICE_URL) is required outside local-dev mode"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.maia/maia.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_timeout_defaults() {
        let ep = EpisodeConfig::default();
        assert_eq!(ep.timeout_minutes(ContextType::Chat), 30);
        assert_eq!(ep.timeout_minutes(ContextType::Development), 120);
        assert_eq!(ep.timeout_minutes(ContextType::Planning), 60);
        assert_eq!(ep.timeout_minutes(ContextType::General), 30);
    }

    #[test]
    fn validate_requires_database_url() {
        let config = MaiaConfig {
            database: DatabaseConfig { url: String::new() },
            gateway: GatewayConfig::default(),
            auth: AuthConfig {
                service_url: None,
                local_dev_mode: true,
            },
            llm: LlmConfig::default(),
            experts: ExpertsConfig::default(),
            episodes: EpisodeConfig::default(),
            breaker: BreakerConfig::default(),
            services: ServicesConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_auth_url_in_production() {
        let mut config = MaiaConfig {
            database: DatabaseConfig {
                url: ":memory:".to_string(),
            },
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            llm: LlmConfig::default(),
            experts: ExpertsConfig::default(),
            episodes: EpisodeConfig::default(),
            breaker: BreakerConfig::default(),
            services: ServicesConfig::default(),
        };
        assert!(config.validate().is_err());
        config.auth.local_dev_mode = true;
        assert!(config.validate().is_ok());
    }
}
