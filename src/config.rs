use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_VISION_MODEL: &str = "moondream";

/// Long enough for a local model on modest hardware.
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(180);

/// Minimum cosine similarity a knowledge chunk needs to be retrieved.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;
pub const DEFAULT_KNOWLEDGE_LIMIT: usize = 2;
pub const DEFAULT_MAX_PROMPT_ELEMENTS: usize = 40;
pub const DEFAULT_HISTORY_LINES: usize = 8;

pub const WHATSAPP_URL: &str = "https://web.whatsapp.com";
pub const GOOGLE_ADS_URL: &str = "https://ads.google.com";
pub const DOCTORALIA_URL: &str = "https://www.doctoralia.com.br";

/// A phrase the operator can name together with a navigation verb to jump
/// straight to a site without asking the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Shortcut {
    pub phrases: Vec<String>,
    pub url: String,
}

impl Shortcut {
    pub fn new(phrases: &[&str], url: impl Into<String>) -> Self {
        Self {
            phrases: phrases.iter().map(|p| p.to_lowercase()).collect(),
            url: url.into(),
        }
    }
}

/// Runtime configuration for the agent core.
///
/// Passed explicitly into `Brain`, `MemoryStore` and `OllamaClient`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ollama_host: String,
    pub model: String,
    pub embed_model: String,
    pub vision_model: String,
    pub inference_timeout: Duration,
    pub data_dir: PathBuf,
    pub similarity_threshold: f32,
    pub knowledge_limit: usize,
    pub max_prompt_elements: usize,
    pub history_lines: usize,
    pub shortcuts: Vec<Shortcut>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            data_dir: PathBuf::from("data"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            knowledge_limit: DEFAULT_KNOWLEDGE_LIMIT,
            max_prompt_elements: DEFAULT_MAX_PROMPT_ELEMENTS,
            history_lines: DEFAULT_HISTORY_LINES,
            shortcuts: default_shortcuts(),
        }
    }
}

fn default_shortcuts() -> Vec<Shortcut> {
    vec![
        Shortcut::new(&["whatsapp"], WHATSAPP_URL),
        Shortcut::new(&["google ads", "adwords"], GOOGLE_ADS_URL),
        Shortcut::new(&["doctoralia"], DOCTORALIA_URL),
    ]
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables. Call `dotenvy::dotenv()`
    /// first if a `.env` file should be honoured.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.ollama_host = host.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            config.model = model;
        }
        if let Ok(model) = std::env::var("AGENT_EMBED_MODEL") {
            config.embed_model = model;
        }
        if let Ok(model) = std::env::var("AGENT_VISION_MODEL") {
            config.vision_model = model;
        }
        if let Ok(dir) = std::env::var("AGENT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.inference_timeout = Duration::from_secs(env_or(
            "AGENT_INFERENCE_TIMEOUT_SECS",
            DEFAULT_INFERENCE_TIMEOUT.as_secs(),
        ));
        config.similarity_threshold =
            env_or("AGENT_SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD);
        config.knowledge_limit = env_or("AGENT_KNOWLEDGE_LIMIT", DEFAULT_KNOWLEDGE_LIMIT);
        config.max_prompt_elements =
            env_or("AGENT_MAX_PROMPT_ELEMENTS", DEFAULT_MAX_PROMPT_ELEMENTS);

        config
    }

    pub fn with_ollama_host(mut self, host: impl Into<String>) -> Self {
        self.ollama_host = host.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_knowledge_limit(mut self, limit: usize) -> Self {
        self.knowledge_limit = limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn with_shortcut(mut self, phrases: &[&str], url: impl Into<String>) -> Self {
        self.shortcuts.push(Shortcut::new(phrases, url));
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Embedding-indexed knowledge chunks.
    pub fn knowledge_path(&self) -> PathBuf {
        self.data_dir.join("library_db.json")
    }

    /// Fast-path action cache.
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("action_cache.json")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.data_dir.join("screenshots")
    }

    /// Persistent Chrome profile, so logins survive restarts.
    pub fn profile_dir(&self) -> PathBuf {
        self.data_dir.join("user_data")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.data_dir.join("library")
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}, using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
