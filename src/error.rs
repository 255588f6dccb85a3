//! Error types for the lark call pipeline.

/// Top-level error type for the voice-agent system.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Audio decode, encode, or framing error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition link error.
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Language model request error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Invalid call-state transition.
    #[error("state error: {0}")]
    State(String),

    /// Tool argument or dispatch error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Telephony control or media channel error.
    #[error("telephony error: {0}")]
    Telephony(String),

    /// Call record or lead persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Session coordination error.
    #[error("session error: {0}")]
    Session(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
