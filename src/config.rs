//! Configuration types for the turn pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KgConfig {
    /// Language model settings.
    pub llm: LlmConfig,
    /// Robot control and choreography settings.
    pub robot: RobotConfig,
    /// Remembered chat settings.
    pub history: HistoryConfig,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible server (with or without `/v1`).
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Model retried once when the provider reports `api_model` does not exist.
    pub fallback_model: Option<String>,
    /// API key sent as a bearer token. Empty for local servers.
    pub api_key: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Name the robot introduces itself with in the default prompt.
    pub robot_name: String,
    /// Custom system prompt. Empty selects the built-in prompt.
    pub system_prompt: String,
    /// Whether exchanges are remembered per device and replayed to the model.
    pub save_chat: bool,
    /// Whether the command grammar is advertised to the model.
    pub commands_enable: bool,
    /// Maximum wait for the next stream event in seconds. 0 disables the bound.
    pub stream_timeout_secs: u64,
    /// Maximum number of tool-call round trips within one turn.
    pub max_tool_rounds: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_owned(),
            api_model: "gpt-4-1106-preview".to_owned(),
            fallback_model: Some("gpt-3.5-turbo".to_owned()),
            api_key: String::new(),
            max_tokens: 2048,
            robot_name: "Vector".to_owned(),
            system_prompt: String::new(),
            save_chat: true,
            commands_enable: true,
            stream_timeout_secs: 30,
            max_tool_rounds: 4,
        }
    }
}

impl LlmConfig {
    /// Per-event stream timeout, `None` when disabled.
    pub fn stream_timeout(&self) -> Option<Duration> {
        (self.stream_timeout_secs > 0).then(|| Duration::from_secs(self.stream_timeout_secs))
    }
}

/// Behaviour when a lease is requested while another one is outstanding on
/// the same robot connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait for the outstanding lease to be released, bounded by the grant timeout.
    #[default]
    Queue,
    /// Fail immediately with a control error.
    FailFast,
}

/// Robot control and choreography configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Robot serial number (ESN) used as the device identifier.
    pub serial: String,
    /// Speech duration scaling passed with every say-text call.
    pub say_duration_scalar: f32,
    /// Animation looped while waiting for the first sentence.
    pub idle_animation: String,
    /// Animation played once right after control is granted.
    pub getin_animation: Option<String>,
    /// Delay before the get-in animation, in milliseconds.
    pub getin_delay_ms: u64,
    /// Animation played once after the response has been spoken.
    pub success_animation: Option<String>,
    /// Delay before the success animation, in milliseconds.
    pub success_delay_ms: u64,
    /// Maximum wait for a control grant in seconds. 0 disables the bound.
    pub grant_timeout_secs: u64,
    /// What to do when a second lease is requested on the same connection.
    pub contention: ContentionPolicy,
    /// Logical animation names (as used by the model) mapped to robot animations.
    pub animations: BTreeMap<String, String>,
    /// Logical sound names mapped to sound files.
    pub sounds: BTreeMap<String, String>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            say_duration_scalar: 1.0,
            idle_animation: "anim_tts_loop_02".to_owned(),
            getin_animation: Some("anim_getin_tts_01".to_owned()),
            getin_delay_ms: 300,
            success_animation: Some("anim_knowledgegraph_success_01".to_owned()),
            success_delay_ms: 100,
            grant_timeout_secs: 10,
            contention: ContentionPolicy::Queue,
            animations: default_animations(),
            sounds: default_sounds(),
        }
    }
}

impl RobotConfig {
    /// Grant timeout, `None` when disabled.
    pub fn grant_timeout(&self) -> Option<Duration> {
        (self.grant_timeout_secs > 0).then(|| Duration::from_secs(self.grant_timeout_secs))
    }
}

fn default_animations() -> BTreeMap<String, String> {
    [
        ("happy", "anim_onboarding_reacttoface_happy_01"),
        ("veryHappy", "anim_onboarding_reacttoface_happy_01"),
        ("sad", "anim_feedback_meanwords_01"),
        ("verySad", "anim_feedback_meanwords_01"),
        ("angry", "anim_keepaway_getout_frustrated_01"),
        ("frustrated", "anim_keepaway_getout_frustrated_01"),
        ("dartingEyes", "anim_observing_self_absorbed_01"),
        ("confused", "anim_meetvictor_lookface_timeout_01"),
        ("thinking", "anim_explorer_scan_short_04"),
        ("celebrate", "anim_pounce_success_03"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

fn default_sounds() -> BTreeMap<String, String> {
    BTreeMap::from([("drumroll".to_owned(), "sounds/drumroll.wav".to_owned())])
}

/// Remembered chat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSON file holding every device's remembered chat.
    pub path: PathBuf,
    /// Message cap per device. Must be even so user/assistant pairs stay intact.
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: crate::kg_dirs::chats_file(),
            max_messages: 16,
        }
    }
}

impl KgConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::KgError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::KgError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::kg_dirs::config_file()
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Config`](crate::error::KgError::Config) describing the first violation.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::KgError;

        if self.history.max_messages < 2 || self.history.max_messages % 2 != 0 {
            return Err(KgError::Config(format!(
                "history.max_messages must be an even number >= 2, got {}",
                self.history.max_messages
            )));
        }
        if !(self.robot.say_duration_scalar > 0.0) {
            return Err(KgError::Config(format!(
                "robot.say_duration_scalar must be positive, got {}",
                self.robot.say_duration_scalar
            )));
        }
        if self.robot.idle_animation.trim().is_empty() {
            return Err(KgError::Config(
                "robot.idle_animation must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
