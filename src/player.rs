//! Speech playback onto the outbound media stream.
//!
//! Converts synthesized PCM to mu-law as it streams in, slices it into
//! telephony frames, and paces each frame onto the media sink at the
//! frame interval so the receiver hears real-time speech instead of a
//! burst. Cancellation is checked before every frame send; a cancelled
//! playback clears the provider's buffered audio and never emits its
//! completion mark.

use base64::Engine as _;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::{TELEPHONY_RATE, encode_mulaw, pcm16_from_le_bytes};
use crate::config::SynthesisConfig;
use crate::error::Result;
use crate::synthesis::SpeechSynthesizer;
use crate::telephony::MediaSink;

/// How a playback run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// All frames sent, completion mark queued.
    Completed,
    /// Stopped by barge-in. Remaining frames dropped, no mark queued.
    Cancelled,
}

/// Streams one agent line to the caller.
pub struct SpeechPlayer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn MediaSink>,
    config: SynthesisConfig,
}

impl SpeechPlayer {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn MediaSink>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            synthesizer,
            sink,
            config,
        }
    }

    /// Synthesize `text` and pace it onto the sink, then queue `mark` so
    /// the provider confirms when the caller has heard everything.
    pub async fn play(
        &self,
        text: &str,
        mark: &str,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let frame_bytes = (self.config.frame_ms as usize) * (TELEPHONY_RATE as usize / 1000);
        let mut transcoder = StreamTranscoder::new(self.config.decimation_factor());
        let mut stream = self.synthesizer.stream_speech(text).await?;
        let mut pending: Vec<u8> = Vec::with_capacity(frame_bytes * 4);
        let mut synthesis_done = false;

        let mut pacer = tokio::time::interval(Duration::from_millis(self.config.frame_ms));
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Buffer at least one frame, or learn that synthesis is over.
            while !synthesis_done && pending.len() < frame_bytes {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.sink.clear().await?;
                        return Ok(PlaybackOutcome::Cancelled);
                    }
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(chunk) => pending.extend(transcoder.push(&chunk?)),
                    None => synthesis_done = true,
                }
            }
            if pending.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.sink.clear().await?;
                    return Ok(PlaybackOutcome::Cancelled);
                }
                _ = pacer.tick() => {}
            }

            let take = pending.len().min(frame_bytes);
            let frame: Vec<u8> = pending.drain(..take).collect();
            let payload = base64::engine::general_purpose::STANDARD.encode(&frame);
            self.sink.send_audio(&payload).await?;
        }

        self.sink.send_mark(mark).await?;
        Ok(PlaybackOutcome::Completed)
    }
}

/// Incremental PCM16-to-mu-law converter.
///
/// Synthesis chunks split anywhere, including mid-sample, so a leftover
/// byte and the decimation phase both carry across chunks.
struct StreamTranscoder {
    factor: usize,
    skip: usize,
    carry: Option<u8>,
}

impl StreamTranscoder {
    fn new(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
            skip: 0,
            carry: None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.carry.take() {
            data.push(byte);
        }
        data.extend_from_slice(chunk);
        if data.len() % 2 == 1 {
            self.carry = data.pop();
        }

        let samples = pcm16_from_le_bytes(&data);
        let mut out = Vec::with_capacity(samples.len() / self.factor + 1);
        for sample in samples {
            if self.skip == 0 {
                out.push(encode_mulaw(sample));
                self.skip = self.factor;
            }
            self.skip -= 1;
        }
        out
    }
}
