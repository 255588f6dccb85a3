//! Lark: real-time AI voice agent for telephony media streams.
//!
//! This crate answers phone calls. A telephony provider hands us the call
//! leg as a WebSocket of base64 mu-law audio; from there the pipeline is:
//!
//! - **Recognition**: continuous streaming transcription over a WebSocket
//!   link, with interim results for barge-in detection
//! - **Dialogue**: turn-based conversation with an OpenAI-compatible model
//!   that can invoke call-handling tools (transfer, booking, lookup,
//!   webhook, hangup, structured info capture)
//! - **Synthesis**: streamed PCM16 speech, transcoded to 8 kHz mu-law and
//!   paced back onto the media stream in 20 ms frames
//!
//! One [`session::CallSession`] owns each call. All state mutates inside
//! its event loop; recognition, dialogue turns, and playback run as tasks
//! reporting back through one channel. The caller can interrupt the agent
//! at any time: barge-in cancels playback mid-frame and the interrupted
//! utterance's completion mark is ignored when it arrives late.

pub mod audio;
pub mod barge_in;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod messages;
pub mod orchestrator;
pub mod persistence;
pub mod player;
pub mod profile;
pub mod recognition;
pub mod sentiment;
pub mod server;
pub mod session;
pub mod state;
pub mod synthesis;
pub mod telephony;
pub mod tools;
pub mod utterance;
pub mod webhook;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use messages::{RecognitionEvent, SessionEvent};
pub use session::{CallSession, SessionContext, SessionHandle};
pub use state::CallState;
