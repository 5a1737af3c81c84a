//! Error types for the kgsim turn pipeline.

/// Top-level error type for a conversation turn.
#[derive(Debug, thiserror::Error)]
pub enum KgError {
    /// Chat request could not be opened (HTTP, auth, model selection).
    #[error("LLM error: {0}")]
    Llm(String),

    /// The delta stream reported an error after it was opened.
    #[error("stream error: {0}")]
    Stream(String),

    /// Robot transport failure outside of control handling and playback.
    #[error("robot error: {0}")]
    Robot(String),

    /// Behavior control could not be acquired or was lost.
    #[error("control error: {0}")]
    Control(String),

    /// A speech, animation or sound action was rejected by the robot.
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Chat history persistence error.
    #[error("history error: {0}")]
    History(String),

    /// Tool execution failed or the tool-call depth limit was reached.
    #[error("tool error: {0}")]
    Tool(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The turn was cancelled by the caller.
    #[error("turn cancelled")]
    Cancelled,

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KgError {
    /// Whether the provider rejected the request because the model is unknown.
    ///
    /// Used to decide whether the configured fallback model should be tried.
    pub fn is_model_not_found(&self) -> bool {
        match self {
            Self::Llm(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("does not exist") || lower.contains("model_not_found")
            }
            _ => false,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, KgError>;
