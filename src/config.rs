//! Configuration types for the voice-agent service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::TELEPHONY_RATE;

/// Top-level configuration for the voice agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Media-stream ingress settings.
    pub server: ServerConfig,
    /// Speech recognition service settings.
    pub recognition: RecognitionConfig,
    /// Speech synthesis service settings.
    pub synthesis: SynthesisConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Dialogue behavior (greeting, closing, turn limits).
    pub dialogue: DialogueConfig,
    /// Barge-in (caller interrupts agent playback) behavior.
    pub barge_in: BargeInConfig,
    /// Call record persistence settings.
    pub persistence: PersistenceConfig,
    /// Outbound webhook notification settings.
    pub webhook: WebhookConfig,
}

/// Media-stream ingress configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the WebSocket ingress.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8_080,
        }
    }
}

/// Speech recognition service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// API key for the recognition service.
    ///
    /// Overridable via `LARK_RECOGNITION_API_KEY`.
    pub api_key: String,
    /// WebSocket endpoint for live transcription.
    pub base_url: String,
    /// Recognition model identifier.
    pub model: String,
    /// BCP-47 language tag sent to the recognizer.
    pub language: String,
    /// Seconds between keepalive frames while no audio is flowing.
    pub keepalive_interval_s: u64,
    /// Minimum trimmed fragment length accepted by the utterance assembler.
    ///
    /// Shorter final fragments are discarded as recognizer noise.
    pub min_fragment_chars: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "wss://api.deepgram.com/v1/listen".to_owned(),
            model: "nova-2-phonecall".to_owned(),
            language: "en-US".to_owned(),
            keepalive_interval_s: 5,
            min_fragment_chars: 2,
        }
    }
}

/// Speech synthesis service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// API key for the synthesis service.
    ///
    /// Overridable via `LARK_SYNTHESIS_API_KEY`.
    pub api_key: String,
    /// HTTP endpoint for synthesis requests.
    pub base_url: String,
    /// Voice identifier sent with every request.
    pub voice: String,
    /// Linear PCM rate of the synthesis output in Hz.
    ///
    /// Must be an integer multiple of the 8 kHz telephony rate; playback
    /// decimates by the ratio.
    pub sample_rate: u32,
    /// Request timeout in seconds.
    pub timeout_s: u64,
    /// Outbound frame duration in milliseconds.
    ///
    /// Telephony media is paced at this interval; 20 ms is the wire default.
    pub frame_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.deepgram.com/v1/speak".to_owned(),
            voice: "aura-asteria-en".to_owned(),
            sample_rate: 24_000,
            timeout_s: 10,
            frame_ms: 20,
        }
    }
}

impl SynthesisConfig {
    /// Decimation factor from the synthesis rate down to the telephony rate.
    pub fn decimation_factor(&self) -> usize {
        (self.sample_rate / TELEPHONY_RATE) as usize
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key for the model provider.
    ///
    /// Overridable via `LARK_LLM_API_KEY`.
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Request timeout in seconds.
    ///
    /// On timeout the agent speaks the apology line instead of staying
    /// silent in `processing`.
    pub timeout_s: u64,
    /// System prompt establishing the agent persona.
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            temperature: 0.7,
            max_tokens: 300,
            timeout_s: 15,
            system_prompt: "You are a friendly, concise phone receptionist. \
                            Answer in one or two short spoken sentences. Use the \
                            available tools to record caller details, look up \
                            customers, book appointments, or hand the call to a \
                            human when asked. Never invent information."
                .to_owned(),
        }
    }
}

/// Dialogue behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Line spoken as soon as the media stream opens.
    pub greeting_line: String,
    /// Line spoken when the turn limit is exceeded or the model ends the call.
    pub closing_line: String,
    /// Line spoken when an external service fails or times out mid-turn.
    pub apology_line: String,
    /// Line spoken while handing the caller to a human agent.
    pub transfer_line: String,
    /// Maximum caller turns before the call is wound down.
    pub max_turns: u32,
    /// Redirect target for transfers (SIP/tel URI or handler URL).
    pub transfer_target: String,
    /// Completed utterances held while a turn is already in flight.
    ///
    /// Beyond this the oldest queued utterance is dropped.
    pub pending_utterance_limit: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            greeting_line: "Hi, thanks for calling. How can I help you today?".to_owned(),
            closing_line: "Thanks for calling. Someone will follow up with you shortly. Goodbye!"
                .to_owned(),
            apology_line: "Sorry, I'm having trouble hearing you. Could you say that again?"
                .to_owned(),
            transfer_line: "Of course, let me connect you with a member of our team. One moment."
                .to_owned(),
            max_turns: 30,
            transfer_target: String::new(),
            pending_utterance_limit: 8,
        }
    }
}

/// Barge-in configuration (caller interrupts agent playback by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether barge-in is enabled.
    pub enabled: bool,
    /// Minimum trimmed length of an interim transcript that counts as an
    /// interruption.
    ///
    /// Explicit speech-started events always count. The length floor keeps
    /// one-word recognizer noise from cancelling playback.
    pub min_interim_chars: usize,
    /// Minimum recognizer confidence for an interim transcript to count,
    /// when the recognizer reports confidence at all.
    pub min_confidence: f32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interim_chars: 10,
            min_confidence: 0.6,
        }
    }
}

/// Call record persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory receiving call, transcript, and lead records.
    pub records_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
        }
    }
}

/// Outbound webhook notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Endpoint receiving queued notifications at cleanup (None disables).
    pub endpoint: Option<String>,
    /// Per-notification request timeout in seconds.
    pub timeout_s: u64,
}

fn default_records_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".lark").join("records")
    } else {
        PathBuf::from("/tmp").join(".lark").join("records")
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AgentError::Config(e.to_string()))
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
            .map_err(|e| crate::error::AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/lark/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("lark").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("lark")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/lark-config/config.toml")
        }
    }

    /// Load from an explicit path, or the default path when present, or defaults.
    ///
    /// API keys are then overridden from the environment
    /// (`LARK_RECOGNITION_API_KEY`, `LARK_SYNTHESIS_API_KEY`,
    /// `LARK_LLM_API_KEY`) so secrets stay out of the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file cannot be read or parsed.
    pub fn load(path: Option<&std::path::Path>) -> crate::error::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Self::default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override secrets from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LARK_RECOGNITION_API_KEY") {
            self.recognition.api_key = key;
        }
        if let Ok(key) = std::env::var("LARK_SYNTHESIS_API_KEY") {
            self.synthesis.api_key = key;
        }
        if let Ok(key) = std::env::var("LARK_LLM_API_KEY") {
            self.llm.api_key = key;
        }
    }

    /// Validate that the configuration can drive a call.
    ///
    /// Checked once at session initialization so a misconfigured deployment
    /// fails with an apologetic close instead of an unhandled fault mid-call.
    ///
    /// # Errors
    ///
    /// Returns a config error naming every problem found.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut problems = Vec::new();

        if self.recognition.api_key.trim().is_empty() {
            problems.push("recognition.api_key is not set");
        }
        if self.synthesis.api_key.trim().is_empty() {
            problems.push("synthesis.api_key is not set");
        }
        if self.llm.api_key.trim().is_empty() {
            problems.push("llm.api_key is not set");
        }
        if self.synthesis.sample_rate < TELEPHONY_RATE
            || !self.synthesis.sample_rate.is_multiple_of(TELEPHONY_RATE)
        {
            problems.push("synthesis.sample_rate must be an integer multiple of 8000");
        }
        if self.synthesis.frame_ms == 0 {
            problems.push("synthesis.frame_ms must be positive");
        }
        if self.dialogue.max_turns == 0 {
            problems.push("dialogue.max_turns must be positive");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(crate::error::AgentError::Config(problems.join("; ")))
        }
    }
}
