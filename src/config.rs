//! Configuration types.
//!
//! Every value has a default; `Config::from_env()` overrides them from
//! `AGENT_JOBS_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Attempts granted to jobs enqueued without an explicit limit.
    pub default_max_attempts: u32,
    /// Runners per queue. They share one in-flight set and each claims one job per tick.
    pub concurrency: usize,
    /// How long shutdown waits for an in-flight turn to finish.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            default_max_attempts: 3,
            concurrency: 1,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Conversation history compaction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Compaction triggers once history holds more than this many messages.
    pub ceiling: usize,
    /// Messages folded into one summary per pass.
    pub chunk_size: usize,
    /// Leading messages (system + initial user turn) never compacted.
    pub preserve_prefix: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            ceiling: 40,
            chunk_size: 10,
            preserve_prefix: 2,
        }
    }
}

/// Agent executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub compaction: CompactionConfig,
    /// Most recent messages considered when summarizing a failed plan.
    pub replan_window: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            compaction: CompactionConfig::default(),
            replan_window: 15,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

/// Completion service connection settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
}

impl LlmConfig {
    /// The API key, or the configuration error a turn reports when it is absent.
    pub fn require_api_key(&self) -> Result<&SecretString, ConfigError> {
        self.api_key.as_ref().ok_or_else(|| ConfigError::MissingRequired {
            key: "AGENT_JOBS_LLM_API_KEY".to_string(),
            hint: "Set it to an API key for the configured completion service.".to_string(),
        })
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Filesystem and shell sandbox for built-in tools.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Every path a tool touches must resolve under this directory.
    pub root: PathBuf,
    pub shell_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./workspace"),
            shell_timeout: Duration::from_secs(30),
        }
    }
}

/// Persona the agent executor plays.
#[derive(Debug, Clone)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            id: "agent-default".to_string(),
            name: "Agent".to_string(),
            role: "software engineering assistant".to_string(),
            goal: "complete the assigned task accurately using the available tools".to_string(),
            backstory: "You work carefully inside a sandboxed workspace and explain what you did."
                .to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub persona: PersonaConfig,
    pub database_path: PathBuf,
    /// When set, logs also go to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
    /// Queues to run one worker loop for.
    pub queues: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            executor: ExecutorConfig::default(),
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            persona: PersonaConfig::default(),
            database_path: PathBuf::from("./data/agent-jobs.db"),
            log_dir: None,
            queues: vec!["default".to_string()],
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(ms) = parse_opt::<u64>(&get, "AGENT_JOBS_POLL_INTERVAL_MS")? {
            config.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_opt::<u32>(&get, "AGENT_JOBS_MAX_ATTEMPTS")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "AGENT_JOBS_MAX_ATTEMPTS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.worker.default_max_attempts = n;
        }
        if let Some(n) = parse_opt::<usize>(&get, "AGENT_JOBS_CONCURRENCY")? {
            config.worker.concurrency = n.max(1);
        }
        if let Some(secs) = parse_opt::<u64>(&get, "AGENT_JOBS_SHUTDOWN_GRACE_SECS")? {
            config.worker.shutdown_grace = Duration::from_secs(secs);
        }

        if let Some(n) = parse_opt::<usize>(&get, "AGENT_JOBS_HISTORY_CEILING")? {
            config.executor.compaction.ceiling = n;
        }
        if let Some(n) = parse_opt::<usize>(&get, "AGENT_JOBS_HISTORY_CHUNK_SIZE")? {
            config.executor.compaction.chunk_size = n;
        }
        if let Some(n) = parse_opt::<usize>(&get, "AGENT_JOBS_HISTORY_PRESERVE")? {
            config.executor.compaction.preserve_prefix = n;
        }
        validate_compaction(&config.executor.compaction)?;

        if let Some(n) = parse_opt::<usize>(&get, "AGENT_JOBS_REPLAN_WINDOW")? {
            config.executor.replan_window = n;
        }
        if let Some(n) = parse_opt::<u32>(&get, "AGENT_JOBS_MAX_TOKENS")? {
            config.executor.max_tokens = n;
        }
        if let Some(t) = parse_opt::<f32>(&get, "AGENT_JOBS_TEMPERATURE")? {
            config.executor.temperature = t;
        }

        if let Some(url) = get("AGENT_JOBS_LLM_BASE_URL") {
            config.llm.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("AGENT_JOBS_LLM_MODEL") {
            config.llm.model = model;
        }
        config.llm.api_key = get("AGENT_JOBS_LLM_API_KEY").map(SecretString::from);
        if let Some(secs) = parse_opt::<u64>(&get, "AGENT_JOBS_LLM_TIMEOUT_SECS")? {
            config.llm.request_timeout = Duration::from_secs(secs);
        }

        if let Some(root) = get("AGENT_JOBS_SANDBOX_ROOT") {
            config.sandbox.root = PathBuf::from(root);
        }
        if let Some(secs) = parse_opt::<u64>(&get, "AGENT_JOBS_SHELL_TIMEOUT_SECS")? {
            config.sandbox.shell_timeout = Duration::from_secs(secs);
        }

        if let Some(v) = get("AGENT_JOBS_PERSONA_NAME") {
            config.persona.name = v;
        }
        if let Some(v) = get("AGENT_JOBS_PERSONA_ROLE") {
            config.persona.role = v;
        }
        if let Some(v) = get("AGENT_JOBS_PERSONA_GOAL") {
            config.persona.goal = v;
        }
        if let Some(v) = get("AGENT_JOBS_PERSONA_BACKSTORY") {
            config.persona.backstory = v;
        }

        if let Some(path) = get("AGENT_JOBS_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        config.log_dir = get("AGENT_JOBS_LOG_DIR").map(PathBuf::from);
        if let Some(queues) = get("AGENT_JOBS_QUEUES") {
            let names: Vec<String> = queues
                .split(',')
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
            if !names.is_empty() {
                config.queues = names;
            }
        }

        Ok(config)
    }
}

fn parse_opt<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn validate_compaction(c: &CompactionConfig) -> Result<(), ConfigError> {
    if c.chunk_size < 2 {
        return Err(ConfigError::InvalidValue {
            key: "AGENT_JOBS_HISTORY_CHUNK_SIZE".to_string(),
            message: "must be at least 2".to_string(),
        });
    }
    if c.preserve_prefix + c.chunk_size > c.ceiling + 1 {
        return Err(ConfigError::InvalidValue {
            key: "AGENT_JOBS_HISTORY_CEILING".to_string(),
            message: format!(
                "ceiling {} leaves no room for a {}-message chunk after {} preserved messages",
                c.ceiling, c.chunk_size, c.preserve_prefix
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_surface() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.worker.default_max_attempts, 3);
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.queues, vec!["default".to_string()]);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("AGENT_JOBS_POLL_INTERVAL_MS", "250"),
            ("AGENT_JOBS_MAX_ATTEMPTS", "5"),
            ("AGENT_JOBS_LLM_API_KEY", "sk-test"),
            ("AGENT_JOBS_QUEUES", "alpha, beta,,"),
            ("AGENT_JOBS_LLM_BASE_URL", "http://localhost:8000/v1/"),
        ]))
        .unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.default_max_attempts, 5);
        assert_eq!(
            config.llm.api_key.as_ref().unwrap().expose_secret(),
            "sk-test"
        );
        assert_eq!(config.queues, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(config.llm.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn unparseable_value_is_rejected() {
        let err = Config::from_lookup(lookup(&[("AGENT_JOBS_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "AGENT_JOBS_POLL_INTERVAL_MS"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(Config::from_lookup(lookup(&[("AGENT_JOBS_MAX_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn compaction_thresholds_must_fit() {
        let err = Config::from_lookup(lookup(&[
            ("AGENT_JOBS_HISTORY_CEILING", "5"),
            ("AGENT_JOBS_HISTORY_CHUNK_SIZE", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let llm = LlmConfig::default();
        assert!(matches!(
            llm.require_api_key(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }
}
