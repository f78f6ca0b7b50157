/// Recognition engine boundary
///
/// The acoustic decoder itself lives outside this crate. The coordinator only
/// commands its search mode and consumes the events it emits, each tagged with
/// the mode that was active when the event was produced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default keyword-spotting threshold (balance between false alarms and misses)
pub const DEFAULT_KEYWORD_THRESHOLD: f64 = 1e-30;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine setup failed: {0}")]
    Setup(String),

    #[error("Failed to start {mode} search: {reason}")]
    Start { mode: SearchMode, reason: String },

    #[error("Engine runtime error: {0}")]
    Runtime(String),

    #[error("Engine has been shut down")]
    ShutDown,
}

/// Named search the recognizer can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Continuous keyword spotting for the wake phrase
    Wake,

    /// Timed, grammar-constrained command decoding
    Command,
}

impl SearchMode {
    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Wake => "wake",
            SearchMode::Command => "command",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recognition result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Recognized text
    pub text: String,

    /// Decoder best score (log domain, closer to zero is better)
    pub best_score: i32,

    /// Secondary probability value reported by the decoder
    pub probability: i32,
}

impl Hypothesis {
    pub fn new(text: impl Into<String>, best_score: i32, probability: i32) -> Self {
        Self {
            text: text.into(),
            best_score,
            probability,
        }
    }

    /// Score magnitude within `threshold`
    pub fn is_confident(&self, threshold: u32) -> bool {
        self.best_score.unsigned_abs() <= threshold
    }
}

/// Event emitted by the engine, tagged with the mode it was produced under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Mid-utterance hypothesis
    Partial {
        mode: SearchMode,
        hypothesis: Hypothesis,
    },

    /// End-of-utterance hypothesis
    Final {
        mode: SearchMode,
        hypothesis: Hypothesis,
    },

    /// Speech stopped
    EndOfUtterance { mode: SearchMode },

    /// The pass hit its timeout
    Timeout { mode: SearchMode },

    /// Runtime failure inside the engine
    Error { mode: SearchMode, message: String },
}

impl EngineEvent {
    pub fn mode(&self) -> SearchMode {
        match self {
            EngineEvent::Partial { mode, .. }
            | EngineEvent::Final { mode, .. }
            | EngineEvent::EndOfUtterance { mode }
            | EngineEvent::Timeout { mode }
            | EngineEvent::Error { mode, .. } => *mode,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Partial { .. } => "partial",
            EngineEvent::Final { .. } => "final",
            EngineEvent::EndOfUtterance { .. } => "end-of-utterance",
            EngineEvent::Timeout { .. } => "timeout",
            EngineEvent::Error { .. } => "error",
        }
    }
}

/// Parameters an engine adapter is built with
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Keyphrase registered for the wake search
    pub wake_phrase: String,

    /// Keyword-spotting sensitivity threshold
    pub keyword_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            wake_phrase: "robot".to_string(),
            keyword_threshold: DEFAULT_KEYWORD_THRESHOLD,
        }
    }
}

/// Speech recognizer controlled by the coordinator.
///
/// Implementations deliver events through the coordinator's
/// [`EventSink`](crate::coordinator::EventSink) from whatever thread they
/// decode on. A pass's final hypothesis must be emitted before its
/// end-of-utterance event: once end-of-utterance is handled the coordinator
/// has already left that pass, and a result produced later (for example by
/// `stop()` finalizing it) is discarded as stale.
#[cfg_attr(test, mockall::automock)]
pub trait RecognitionEngine: Send + Sync {
    /// Start a pass in `mode`, optionally bounded by `timeout`
    fn start(&self, mode: SearchMode, timeout: Option<Duration>) -> Result<(), EngineError>;

    /// Stop the current pass.
    ///
    /// Any hypothesis this emits arrives after the coordinator switched modes
    /// and is dropped.
    fn stop(&self);

    /// Abort the current pass without emitting a result
    fn cancel(&self);

    /// Release engine resources
    fn shutdown(&self);

    /// Mode of the running pass, if any
    fn current_mode(&self) -> Option<SearchMode>;
}
