//! Message types flowing between the session loop and its worker tasks.
//!
//! Everything that can mutate session state arrives as a [`SessionEvent`]
//! on the session's single inbound channel: recognition output, dialogue
//! task results, playback marks echoed by the telephony channel, and
//! stream closure. The loop is the only consumer, so ordering between a
//! barge-in and the mark it invalidated is never a race.

use crate::tools::ToolKind;

/// One event from the recognition service.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// A transcript fragment.
    Transcript {
        text: String,
        /// Whether the recognizer will revise this fragment further.
        is_final: bool,
        /// Whether the recognizer considers the utterance finished.
        speech_final: bool,
        /// Recognizer confidence for the fragment, when reported.
        confidence: Option<f32>,
    },
    /// Out-of-band start-of-speech signal.
    SpeechStarted,
    /// Out-of-band end-of-utterance signal.
    UtteranceEnd,
    /// The link is gone and will not reconnect.
    Closed,
}

/// What the session does once an utterance finishes playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSpeech {
    /// Go back to listening.
    Resume,
    /// Redirect the call leg to a human.
    Transfer,
    /// Wind the call down.
    HangUp,
}

/// Result of one dialogue turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Text to speak, if the turn produced any.
    pub say: Option<String>,
    /// What to do after the text has played out.
    pub after: AfterSpeech,
}

/// Progress reports from the dialogue task.
#[derive(Debug, Clone)]
pub enum DialogueEvent {
    /// A named tool action began; the call state mirrors it.
    ActionStarted(ToolKind),
    /// The action finished and the turn continues.
    ActionFinished(ToolKind),
    /// The turn is complete.
    TurnReady(TurnOutcome),
}

/// Everything the session loop consumes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Recognition(RecognitionEvent),
    Dialogue(DialogueEvent),
    /// The telephony channel confirmed playback of a named mark.
    MarkReceived { name: String },
    /// The player could not synthesize or queue the utterance.
    SpeakFailed { mark: String },
    /// The media stream closed.
    MediaClosed,
}
