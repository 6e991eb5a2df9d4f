//! Incremental generation session
//!
//! Drives a token generator one step at a time, decodes each generated token
//! into a text fragment, and streams the fragments to a consumer. The session
//! ends when the generator reports completion, when a conversational stop
//! marker shows up in the decoded output, when the consumer cancels or goes
//! away, or when a step fails.
//!
//! The generator and decoder are trait seams: in production they are backed
//! by llama-cpp objects owned by the engine worker thread, in tests by
//! scripted stubs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::inference::prompt::STOP_MARKERS;
use crate::inference::streaming::{FinishReason, GenerationError, StreamEvent};

/// Token identifier as produced by the tokenizer vocabulary.
pub type TokenId = i32;

/// One-token-at-a-time generator over a bound (model, parameters, prompt).
///
/// A step is two ordered sub-steps: [`compute_scores`](Self::compute_scores)
/// produces the next-token distribution, [`append_next_token`](Self::append_next_token)
/// selects a token and appends it to the internal sequence. Callers must not
/// skip or reorder them.
pub trait TokenGenerator {
    /// True once the generator has concluded on its own (end-of-generation
    /// token or length budget).
    fn is_done(&self) -> bool;

    /// Scores the current sequence, producing the next-token distribution.
    fn compute_scores(&mut self) -> Result<(), String>;

    /// Selects the next token from the current scores and appends it to the
    /// internal sequence.
    fn append_next_token(&mut self) -> Result<(), String>;

    /// The most recently appended token, if any tokens exist.
    fn last_token(&self) -> Option<TokenId>;
}

/// Stateful token-to-text decoder.
///
/// Multi-token subwords are reassembled across calls, so tokens must be fed
/// in strict generation order, one call per token, never skipping. A call may
/// return an empty fragment while bytes are held back.
pub trait DecodeStream {
    fn decode_next(&mut self, token: TokenId) -> Result<String, String>;
}

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sleep before each step so the host stays responsive during a long
    /// generation. Advisory; zero disables the yield.
    pub step_yield: Duration,
    /// Literal substrings that end the session when they appear in the
    /// accumulated output.
    pub stop_markers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_yield: Duration::from_millis(10),
            stop_markers: STOP_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The generator reported completion with no stop marker observed.
    Completed,
    /// A stop marker appeared; the triggering fragment was withheld.
    StoppedByMarker,
    /// The stop signal was raised or the consumer dropped the receiver.
    Cancelled,
    /// A step failed; fragments emitted before the failure stand.
    Failed(String),
}

/// Result of driving a session to its end.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    /// Number of fragments delivered to the consumer.
    pub fragments_emitted: usize,
    /// Full decoded text, including a withheld stop-marker fragment if any.
    pub text: String,
}

/// A single streaming generation: owns its generator and decode stream for
/// exactly one run.
///
/// [`run`](Self::run) consumes the session, so both owned resources are
/// released on every exit path.
pub struct GenerationSession<G, D> {
    generator: G,
    decoder: D,
    config: SessionConfig,
    /// Concatenation of every decoded fragment so far. Scanned for stop
    /// markers; the emitted fragments are always a prefix of it.
    buffer: String,
    emitted: usize,
    max_marker_len: usize,
}

impl<G: TokenGenerator, D: DecodeStream> GenerationSession<G, D> {
    pub fn new(generator: G, decoder: D, config: SessionConfig) -> Self {
        let max_marker_len = config.stop_markers.iter().map(|m| m.len()).max().unwrap_or(0);
        Self {
            generator,
            decoder,
            config,
            buffer: String::new(),
            emitted: 0,
            max_marker_len,
        }
    }

    /// Drives the generator until it concludes, a stop marker appears, the
    /// session is cancelled, or a step fails.
    ///
    /// Fragments are sent over `events` strictly in generation order. A send
    /// failure means the consumer dropped the receiver; the session stops
    /// promptly. Step failures are caught here and never propagate past the
    /// loop.
    pub fn run(mut self, events: &UnboundedSender<StreamEvent>, stop_signal: &AtomicBool) -> SessionOutcome {
        let mut end = SessionEnd::Completed;

        while !self.generator.is_done() {
            if stop_signal.load(Ordering::Relaxed) {
                tracing::debug!("generation stopped by signal");
                end = SessionEnd::Cancelled;
                break;
            }

            if !self.config.step_yield.is_zero() {
                thread::sleep(self.config.step_yield);
            }

            let fragment = match self.step() {
                Ok(fragment) => fragment,
                Err(e) => {
                    tracing::warn!("generation step failed: {e}");
                    end = SessionEnd::Failed(e);
                    break;
                }
            };

            if self.append_and_scan(&fragment) {
                // The model started the next conversational turn; withhold
                // the fragment that completed the marker.
                tracing::debug!("stop marker detected after {} fragments", self.emitted);
                end = SessionEnd::StoppedByMarker;
                break;
            }

            if events.send(StreamEvent::Fragment(fragment)).is_err() {
                tracing::debug!("receiver dropped, stopping generation");
                end = SessionEnd::Cancelled;
                break;
            }
            self.emitted += 1;
        }

        let event = match &end {
            SessionEnd::Completed => StreamEvent::Done(FinishReason::Completed),
            SessionEnd::StoppedByMarker => StreamEvent::Done(FinishReason::StopMarker),
            SessionEnd::Cancelled => StreamEvent::Done(FinishReason::Cancelled),
            SessionEnd::Failed(e) => StreamEvent::Error(GenerationError::StepFailure(e.clone())),
        };
        let _ = events.send(event);

        tracing::debug!(
            "session finished: {:?}, {} fragments, {} chars",
            end,
            self.emitted,
            self.buffer.len()
        );
        SessionOutcome {
            end,
            fragments_emitted: self.emitted,
            text: self.buffer,
        }
    }

    /// One generation step: score, append a token, decode exactly that token.
    fn step(&mut self) -> Result<String, String> {
        self.generator.compute_scores()?;
        self.generator.append_next_token()?;
        let token = self
            .generator
            .last_token()
            .ok_or_else(|| "generator advanced without producing a token".to_string())?;
        self.decoder.decode_next(token)
    }

    /// Appends the fragment to the accumulated buffer and reports whether a
    /// stop marker is now present.
    ///
    /// Only the tail window that could contain a marker ending in the new
    /// fragment is scanned; earlier text was already scanned on previous
    /// steps, so first-occurrence semantics are unchanged.
    fn append_and_scan(&mut self, fragment: &str) -> bool {
        let window_start = self
            .buffer
            .len()
            .saturating_sub(self.max_marker_len.saturating_sub(1));
        self.buffer.push_str(fragment);
        let tail = &self.buffer[floor_char_boundary(&self.buffer, window_start)..];
        self.config.stop_markers.iter().any(|m| tail.contains(m.as_str()))
    }
}

/// Largest index `<= index` that sits on a char boundary of `s`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut end = index;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
