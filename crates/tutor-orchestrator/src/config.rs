//! Configuration types for the tutoring session engine.
//!
//! Settings are read from `tutor.json` (camelCase keys). Every field has a
//! default, so a missing file or a partial file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::completion::CompletionTask;
use crate::error::{Result, TutorError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "tutor.json";

const fn default_max_hints() -> u32 {
    3
}

const fn default_max_xp() -> u32 {
    25
}

fn default_themes() -> Vec<String> {
    vec![
        "football".to_string(),
        "space".to_string(),
        "robots".to_string(),
    ]
}

const fn default_min_difficulty() -> u8 {
    1
}

const fn default_max_difficulty() -> u8 {
    5
}

const fn default_max_nickname_length() -> usize {
    50
}

fn default_base_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_api_key_env() -> String {
    "LITELLM_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4".to_string()
}

/// Default timeout in seconds for one completion attempt.
const fn default_timeout_seconds() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

/// Upper bound accepted for `completion.maxRetries`.
const MAX_RETRIES_LIMIT: u32 = 10;

const fn default_max_tokens() -> u32 {
    1000
}

fn default_state_dir() -> String {
    ".tutor/sessions".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8000
}

const fn default_channel_capacity() -> usize {
    256
}

/// Main configuration for the tutor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Hint budget settings.
    #[serde(default)]
    pub hints: HintConfig,

    /// Grading settings.
    #[serde(default)]
    pub grading: GradingConfig,

    /// Accepted lesson parameters.
    #[serde(default)]
    pub lesson: LessonConfig,

    /// Completion service connection and routing.
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Session store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Telemetry stream settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `tutor.json` in the current directory and falls back to
    /// defaults when it is absent.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            TutorError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `tutor.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        Self::load_from_file(&config_path)
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigParseError` if the file exists but contains
    /// invalid JSON, and `TutorError::ConfigValidationError` if a value is out
    /// of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(TutorError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TutorError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigValidationError` for the first check that fails.
    pub fn validate(&self) -> Result<()> {
        if self.hints.max_hints_per_milestone == 0 {
            return Err(TutorError::config_validation(
                "hints.maxHintsPerMilestone must be greater than 0",
                "Set hints.maxHintsPerMilestone to at least 1 in your tutor.json",
            ));
        }

        if self.grading.max_xp_per_milestone == 0 {
            return Err(TutorError::config_validation(
                "grading.maxXpPerMilestone must be greater than 0",
                "Set grading.maxXpPerMilestone to at least 1 in your tutor.json",
            ));
        }

        if self.lesson.themes.iter().all(|t| t.trim().is_empty()) {
            return Err(TutorError::config_validation(
                "lesson.themes must contain at least one theme",
                "List the allowed themes, e.g. [\"football\", \"space\", \"robots\"]",
            ));
        }

        if self.lesson.min_difficulty == 0 || self.lesson.min_difficulty > self.lesson.max_difficulty
        {
            return Err(TutorError::config_validation(
                format!(
                    "lesson difficulty range {}..={} is invalid",
                    self.lesson.min_difficulty, self.lesson.max_difficulty
                ),
                "Use a range like minDifficulty 1 and maxDifficulty 5",
            ));
        }

        if self.lesson.max_nickname_length == 0 {
            return Err(TutorError::config_validation(
                "lesson.maxNicknameLength must be greater than 0",
                "Set lesson.maxNicknameLength to at least 1 in your tutor.json",
            ));
        }

        if self.completion.base_url.trim().is_empty() {
            return Err(TutorError::config_validation(
                "completion.baseUrl must not be empty",
                "Point completion.baseUrl at your LLM proxy, e.g. http://localhost:4000",
            ));
        }

        if self.completion.timeout_seconds == 0 {
            return Err(TutorError::config_validation(
                "completion.timeoutSeconds must be greater than 0",
                "Set completion.timeoutSeconds to at least 1 second in your tutor.json",
            ));
        }

        if self.completion.max_retries > MAX_RETRIES_LIMIT {
            return Err(TutorError::config_validation(
                format!(
                    "completion.maxRetries is {} (limit {MAX_RETRIES_LIMIT})",
                    self.completion.max_retries
                ),
                "Keep completion.maxRetries small, e.g. 2, so a failing proxy is reported quickly",
            ));
        }

        if self.completion.max_backoff_ms == 0
            || self.completion.retry_backoff_ms > self.completion.max_backoff_ms
        {
            return Err(TutorError::config_validation(
                format!(
                    "completion backoff {}ms..{}ms is invalid",
                    self.completion.retry_backoff_ms, self.completion.max_backoff_ms
                ),
                "Set completion.maxBackoffMs above 0 and at least completion.retryBackoffMs",
            ));
        }

        if self.completion.max_tokens == 0 {
            return Err(TutorError::config_validation(
                "completion.maxTokens must be greater than 0",
                "Set completion.maxTokens to at least 1 in your tutor.json",
            ));
        }

        if self.store.state_dir.trim().is_empty() {
            return Err(TutorError::config_validation(
                "store.stateDir must not be empty",
                "Provide a directory for session snapshots, e.g. .tutor/sessions",
            ));
        }

        if self.telemetry.channel_capacity == 0 {
            return Err(TutorError::config_validation(
                "telemetry.channelCapacity must be greater than 0",
                "Set telemetry.channelCapacity to at least 1 in your tutor.json",
            ));
        }

        Ok(())
    }
}

/// Hint budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintConfig {
    /// Maximum hints a learner may request per milestone.
    #[serde(default = "default_max_hints")]
    pub max_hints_per_milestone: u32,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            max_hints_per_milestone: default_max_hints(),
        }
    }
}

/// Grading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingConfig {
    /// Upper bound for xp awarded by a single passing verdict.
    #[serde(default = "default_max_xp")]
    pub max_xp_per_milestone: u32,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            max_xp_per_milestone: default_max_xp(),
        }
    }
}

/// Accepted parameters for new sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonConfig {
    /// Themes a learner may pick. Matching is case-insensitive.
    #[serde(default = "default_themes")]
    pub themes: Vec<String>,

    /// Lowest accepted difficulty level.
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: u8,

    /// Highest accepted difficulty level.
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: u8,

    /// Longest accepted nickname, in characters.
    #[serde(default = "default_max_nickname_length")]
    pub max_nickname_length: usize,
}

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            themes: default_themes(),
            min_difficulty: default_min_difficulty(),
            max_difficulty: default_max_difficulty(),
            max_nickname_length: default_max_nickname_length(),
        }
    }
}

impl LessonConfig {
    /// Returns the canonical spelling of `theme` if it is allowed.
    #[must_use]
    pub fn resolve_theme(&self, theme: &str) -> Option<&str> {
        let wanted = theme.trim();
        self.themes
            .iter()
            .find(|t| t.eq_ignore_ascii_case(wanted))
            .map(String::as_str)
    }
}

/// Completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionConfig {
    /// Base URL of the OpenAI-compatible proxy.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used when a task has no routing entry.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Per-task model routing.
    #[serde(default)]
    pub models: ModelRouting,

    /// Timeout for a single request attempt.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff; doubles on each retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Longest wait between attempts, including a proxy's `Retry-After`.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Token limit per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            models: ModelRouting::default(),
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl CompletionConfig {
    /// Returns the model to use for `task`.
    #[must_use]
    pub fn model_for(&self, task: CompletionTask) -> &str {
        let routed = match task {
            CompletionTask::Planning => self.models.planning.as_deref(),
            CompletionTask::Coaching => self.models.coaching.as_deref(),
            CompletionTask::Grading => self.models.grading.as_deref(),
        };
        routed.unwrap_or(&self.default_model)
    }

    /// Per-attempt timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Backoff before retry number `attempt` (1-based), capped at
    /// `max_backoff_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(self.max_backoff())
    }

    /// Longest wait between two attempts.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Wait before retry number `attempt`, preferring the proxy's
    /// `Retry-After` but never exceeding `max_backoff_ms`.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.map_or_else(|| self.backoff(attempt), |d| d.min(self.max_backoff()))
    }

    /// Deadline for one `complete` call across every attempt and wait.
    #[must_use]
    pub fn total_deadline(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        self.timeout()
            .saturating_mul(attempts)
            .saturating_add(self.max_backoff().saturating_mul(self.max_retries))
    }
}

/// Optional model override per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRouting {
    /// Model for lesson planning.
    #[serde(default)]
    pub planning: Option<String>,
    /// Model for hints.
    #[serde(default)]
    pub coaching: Option<String>,
    /// Model for grading.
    #[serde(default)]
    pub grading: Option<String>,
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Directory holding one JSON snapshot per session.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Telemetry stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// Events buffered per subscriber before old ones are dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}
