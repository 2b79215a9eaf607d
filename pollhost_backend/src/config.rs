use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for every configured interval, threshold and deadline.
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// What the supervisor does with the sibling worker when one worker fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and keep the other worker running.
    #[default]
    Isolate,
    /// Abort the other worker and stop the process.
    Cascade,
}

impl FailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "isolate" => Some(FailurePolicy::Isolate),
            "cascade" => Some(FailurePolicy::Cascade),
            _ => None,
        }
    }
}

/// Role priming for every generated message. Placeholders: `{host}`,
/// `{max_words}`, `{context}` and `{input}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_template")]
    pub template: String,
    #[serde(default = "default_host_name")]
    pub host_name: String,
    #[serde(default = "default_max_words")]
    pub max_words: u32,
    #[serde(default = "default_idle_cue")]
    pub idle_cue: String,
    #[serde(default = "default_poll_update_cue")]
    pub poll_update_cue: String,
}

fn default_persona_template() -> String {
    "You're {host}, hosting a live quiz show. Current status:\n{context}\n\
     User said: {input}\n\
     Respond in {host}'s style, max {max_words} words. Be witty and professional. \
     Do not say anything that can be taken as abusive."
        .to_string()
}

fn default_host_name() -> String {
    "the Quizmaster".to_string()
}

fn default_max_words() -> u32 {
    30
}

fn default_idle_cue() -> String {
    "prompt".to_string()
}

fn default_poll_update_cue() -> String {
    "poll-update".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            template: default_persona_template(),
            host_name: default_host_name(),
            max_words: default_max_words(),
            idle_cue: default_idle_cue(),
            poll_update_cue: default_poll_update_cue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,

    // Document store
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_user_collection")]
    pub user_collection: String,
    #[serde(default = "default_reply_collection")]
    pub reply_collection: String,
    #[serde(default = "default_poll_collection")]
    pub poll_collection: String,
    #[serde(default = "default_poll_document_id")]
    pub poll_document_id: String,
    #[serde(default = "default_host_prompt_id")]
    pub host_prompt_id: String,

    // Monitor timing
    #[serde(default = "default_monitor_tick_secs")]
    pub monitor_tick_secs: u64,
    #[serde(default = "default_idle_user_threshold_secs")]
    pub idle_user_threshold_secs: u64,
    #[serde(default = "default_idle_response_threshold_secs")]
    pub idle_response_threshold_secs: u64,
    #[serde(default = "default_poll_update_threshold_secs")]
    pub poll_update_threshold_secs: u64,

    // Change feed
    #[serde(default = "default_subscription_poll_interval_ms")]
    pub subscription_poll_interval_ms: u64,
    #[serde(default)]
    pub subscription_deadline_secs: Option<u64>,

    #[serde(default)]
    pub persona: PersonaConfig,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    // HTTP API (disabled when unset)
    #[serde(default)]
    pub api_bind: Option<String>,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_database_path() -> String {
    "pollhost.db".to_string()
}

fn default_user_collection() -> String {
    "chat_user".to_string()
}

fn default_reply_collection() -> String {
    "chat_pings".to_string()
}

fn default_poll_collection() -> String {
    "chat_poll".to_string()
}

fn default_poll_document_id() -> String {
    "q1".to_string()
}

fn default_host_prompt_id() -> String {
    "host-prompt".to_string()
}

fn default_monitor_tick_secs() -> u64 {
    10
}

fn default_idle_user_threshold_secs() -> u64 {
    30
}

fn default_idle_response_threshold_secs() -> u64 {
    10
}

fn default_poll_update_threshold_secs() -> u64 {
    15
}

fn default_subscription_poll_interval_ms() -> u64 {
    500
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            database_path: default_database_path(),
            user_collection: default_user_collection(),
            reply_collection: default_reply_collection(),
            poll_collection: default_poll_collection(),
            poll_document_id: default_poll_document_id(),
            host_prompt_id: default_host_prompt_id(),
            monitor_tick_secs: default_monitor_tick_secs(),
            idle_user_threshold_secs: default_idle_user_threshold_secs(),
            idle_response_threshold_secs: default_idle_response_threshold_secs(),
            poll_update_threshold_secs: default_poll_update_threshold_secs(),
            subscription_poll_interval_ms: default_subscription_poll_interval_ms(),
            subscription_deadline_secs: None,
            persona: PersonaConfig::default(),
            failure_policy: FailurePolicy::default(),
            api_bind: None,
        }
    }
}

impl HostConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        env::var("POLLHOST_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::get_base_dir().join("pollhost_config.toml"))
    }

    /// Load config from pollhost_config.toml, falling back to defaults + env vars.
    ///
    /// A config file that exists but does not parse is an error: the process
    /// must not start on a half-read configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        let config = match fs::read_to_string(&path) {
            Ok(contents) => {
                let config = Self::from_toml_str(&contents)
                    .with_context(|| format!("Failed to parse {:?}", path))?;
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(_) => {
                tracing::warn!("No config file found at {:?}, using defaults + env vars", path);
                Self::from_env()
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<HostConfig>(contents).context("Invalid pollhost config")
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("POLLHOST_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("POLLHOST_LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("POLLHOST_LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Ok(raw) = env::var("POLLHOST_TEMPERATURE") {
            if let Ok(temperature) = raw.parse() {
                config.temperature = temperature;
            }
        }

        if let Ok(raw) = env::var("POLLHOST_MAX_TOKENS") {
            if let Ok(max_tokens) = raw.parse() {
                config.max_tokens = Some(max_tokens);
            }
        }

        if let Ok(path) = env::var("POLLHOST_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(name) = env::var("POLLHOST_USER_COLLECTION") {
            config.user_collection = name;
        }

        if let Ok(name) = env::var("POLLHOST_REPLY_COLLECTION") {
            config.reply_collection = name;
        }

        if let Ok(name) = env::var("POLLHOST_POLL_COLLECTION") {
            config.poll_collection = name;
        }

        if let Ok(id) = env::var("POLLHOST_POLL_DOCUMENT_ID") {
            config.poll_document_id = id;
        }

        if let Ok(id) = env::var("POLLHOST_HOST_PROMPT_ID") {
            config.host_prompt_id = id;
        }

        if let Ok(interval) = env::var("POLLHOST_MONITOR_TICK_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.monitor_tick_secs = seconds;
            }
        }

        for (key, field) in [
            (
                "POLLHOST_IDLE_USER_THRESHOLD_SECS",
                &mut config.idle_user_threshold_secs,
            ),
            (
                "POLLHOST_IDLE_RESPONSE_THRESHOLD_SECS",
                &mut config.idle_response_threshold_secs,
            ),
            (
                "POLLHOST_POLL_UPDATE_THRESHOLD_SECS",
                &mut config.poll_update_threshold_secs,
            ),
        ] {
            if let Some(seconds) = env::var(key).ok().and_then(|raw| raw.parse().ok()) {
                *field = seconds;
            }
        }

        if let Ok(interval) = env::var("POLLHOST_SUBSCRIPTION_POLL_INTERVAL_MS") {
            if let Ok(millis) = interval.parse() {
                config.subscription_poll_interval_ms = millis;
            }
        }

        if let Ok(deadline) = env::var("POLLHOST_SUBSCRIPTION_DEADLINE_SECS") {
            if let Ok(seconds) = deadline.parse() {
                config.subscription_deadline_secs = Some(seconds);
            }
        }

        if let Ok(policy) = env::var("POLLHOST_FAILURE_POLICY") {
            match FailurePolicy::parse(&policy) {
                Some(policy) => config.failure_policy = policy,
                None => tracing::warn!("Ignoring unknown POLLHOST_FAILURE_POLICY '{}'", policy),
            }
        }

        if let Ok(template) = env::var("POLLHOST_PERSONA_TEMPLATE") {
            if !template.trim().is_empty() {
                config.persona.template = template;
            }
        }

        if let Ok(name) = env::var("POLLHOST_HOST_NAME") {
            config.persona.host_name = name;
        }

        if let Ok(raw) = env::var("POLLHOST_MAX_WORDS") {
            if let Ok(max_words) = raw.parse() {
                config.persona.max_words = max_words;
            }
        }

        if let Ok(cue) = env::var("POLLHOST_IDLE_CUE") {
            config.persona.idle_cue = cue;
        }

        if let Ok(cue) = env::var("POLLHOST_POLL_UPDATE_CUE") {
            config.persona.poll_update_cue = cue;
        }

        if let Ok(bind) = env::var("POLLHOST_API_BIND") {
            if !bind.trim().is_empty() {
                config.api_bind = Some(bind);
            }
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("user_collection", &self.user_collection),
            ("reply_collection", &self.reply_collection),
            ("poll_collection", &self.poll_collection),
        ] {
            if name.trim().is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
            if name.contains('"') {
                anyhow::bail!("{} must not contain '\"': {}", field, name);
            }
        }
        if self.poll_document_id.trim().is_empty() {
            anyhow::bail!("poll_document_id must not be empty");
        }
        if self.host_prompt_id.trim().is_empty() {
            anyhow::bail!("host_prompt_id must not be empty");
        }
        if self.monitor_tick_secs == 0 {
            anyhow::bail!("monitor_tick_secs must be at least 1");
        }
        if self.subscription_poll_interval_ms == 0 {
            anyhow::bail!("subscription_poll_interval_ms must be at least 1");
        }
        for (field, secs) in [
            ("monitor_tick_secs", Some(self.monitor_tick_secs)),
            ("idle_user_threshold_secs", Some(self.idle_user_threshold_secs)),
            ("idle_response_threshold_secs", Some(self.idle_response_threshold_secs)),
            ("poll_update_threshold_secs", Some(self.poll_update_threshold_secs)),
            ("subscription_deadline_secs", self.subscription_deadline_secs),
            (
                "subscription_poll_interval_ms",
                Some(self.subscription_poll_interval_ms / 1_000),
            ),
        ] {
            if matches!(secs, Some(secs) if secs > MAX_INTERVAL_SECS) {
                anyhow::bail!("{} exceeds {} seconds", field, MAX_INTERVAL_SECS);
            }
        }
        Ok(())
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_secs(self.monitor_tick_secs)
    }

    pub fn subscription_poll_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_poll_interval_ms)
    }

    pub fn subscription_deadline(&self) -> Option<Duration> {
        self.subscription_deadline_secs.map(Duration::from_secs)
    }
}
