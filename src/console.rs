/// Console stand-ins for the audio collaborators
///
/// Lets the service run without a microphone or a voice: each stdin line is
/// treated as recognized speech, replies are printed.

use crate::coordinator::EventSink;
use crate::engine::{EngineError, EngineSettings, Hypothesis, RecognitionEngine, SearchMode};
use crate::notify::{BatteryMonitor, BatteryReading, ChargeState};
use crate::shared_state::SpeakingResolver;
use crate::speech::{CueTone, SynthesisError, Synthesizer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Score given to typed commands
pub const CONSOLE_SCORE: i32 = -500;

/// Score given to mumbled (`~`-prefixed) commands, below any sane threshold
pub const MUMBLE_SCORE: i32 = -5000;

/// Recognizer fed from console lines
pub struct ConsoleEngine {
    settings: EngineSettings,
    sink: EventSink,
    mode: Mutex<Option<SearchMode>>,
    shut_down: AtomicBool,
}

impl ConsoleEngine {
    pub fn new(settings: EngineSettings, sink: EventSink) -> Self {
        info!(
            "Console recognizer ready (keyphrase '{}', threshold {:e})",
            settings.wake_phrase, settings.keyword_threshold
        );

        Self {
            settings,
            sink,
            mode: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Treat `line` as speech heard by the running pass.
    ///
    /// Wake pass: partial hypothesis. Command pass: final hypothesis, a
    /// blank line ends the utterance, a `~` prefix marks it as mumbled.
    pub fn hear(&self, line: &str) {
        let Some(mode) = *self.mode.lock() else {
            debug!("Recognizer idle, ignoring '{}'", line);
            return;
        };

        let text = line.trim();

        match mode {
            SearchMode::Wake => {
                if !text.is_empty() {
                    self.sink.partial(mode, Hypothesis::new(text, -300, 0));
                }
            }
            SearchMode::Command => {
                if text.is_empty() {
                    self.sink.end_of_utterance(mode);
                } else if let Some(mumbled) = text.strip_prefix('~') {
                    self.sink
                        .final_result(mode, Hypothesis::new(mumbled.trim(), MUMBLE_SCORE, 0));
                } else {
                    self.sink.final_result(mode, Hypothesis::new(text, CONSOLE_SCORE, 0));
                }
            }
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl RecognitionEngine for ConsoleEngine {
    fn start(&self, mode: SearchMode, timeout: Option<Duration>) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        *self.mode.lock() = Some(mode);
        debug!("Console {} search started (timeout {:?})", mode, timeout);

        if mode == SearchMode::Command {
            println!("(listening for a command...)");
        }
        Ok(())
    }

    fn stop(&self) {
        *self.mode.lock() = None;
    }

    fn cancel(&self) {
        *self.mode.lock() = None;
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        *self.mode.lock() = None;
        debug!("Console recognizer released");
    }

    fn current_mode(&self) -> Option<SearchMode> {
        *self.mode.lock()
    }
}

/// Prints utterances and pretends to take time saying them
pub struct ConsoleSynthesizer {
    per_word: Duration,
    busy: Arc<AtomicBool>,
}

impl Default for ConsoleSynthesizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl ConsoleSynthesizer {
    pub fn new(per_word: Duration) -> Self {
        Self {
            per_word,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Synthesizer for ConsoleSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<(), SynthesisError> {
        self.busy.store(true, Ordering::SeqCst);
        let _guard = BusyGuard(self.busy.clone());

        let mut stdout = std::io::stdout();
        writeln!(stdout, "[robot-head] {}", text).map_err(|e| SynthesisError::Failed(e.to_string()))?;

        let words = text.split_whitespace().count().max(1) as u32;
        tokio::time::sleep(self.per_word * words).await;
        Ok(())
    }

    fn busy_resolver(&self) -> Option<SpeakingResolver> {
        let busy = self.busy.clone();
        Some(Arc::new(move || busy.load(Ordering::SeqCst)))
    }
}

/// Terminal bell as the listening cue
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl CueTone for TerminalBell {
    fn play(&self) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(b"\x07");
        let _ = stdout.flush();
    }
}

/// Console directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Speech(String),
    Battery(BatteryReading),
    Quit,
}

/// Classify one console line.
///
/// `/battery <percent> [charging]` simulates a battery broadcast, `/quit`
/// exits, anything else is speech.
pub fn parse_line(line: &str) -> Option<ConsoleInput> {
    let trimmed = line.trim();

    let Some(directive) = trimmed.strip_prefix('/') else {
        return Some(ConsoleInput::Speech(line.to_string()));
    };

    let mut parts = directive.split_whitespace();
    match parts.next() {
        Some("quit") | Some("exit") => Some(ConsoleInput::Quit),
        Some("battery") => {
            let level = parts.next()?.parse::<i32>().ok()?;
            let status = match parts.next() {
                Some("charging") => ChargeState::Charging,
                Some("full") => ChargeState::Full,
                _ => ChargeState::Discharging,
            };
            Some(ConsoleInput::Battery(BatteryReading::new(level, 100, status)))
        }
        _ => None,
    }
}

/// Read stdin until EOF, `/quit`, or cancellation
pub async fn run_console(
    engine: Arc<ConsoleEngine>,
    battery: Arc<BatteryMonitor>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Failed to read console input: {}", e);
                break;
            }
        };

        match parse_line(&line) {
            Some(ConsoleInput::Speech(text)) => engine.hear(&text),
            Some(ConsoleInput::Battery(reading)) => {
                battery.on_reading(reading);
            }
            Some(ConsoleInput::Quit) => break,
            None => warn!("Unknown console directive: {}", line.trim()),
        }
    }
}
