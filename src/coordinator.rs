/// Voice interaction coordinator
///
/// Owns the recognition state machine: passive wake-phrase spotting, a
/// time-boxed command window, and recovery back to spotting on timeout,
/// end of utterance, dispatch or engine error. All inputs (engine callbacks,
/// the command timer, shutdown requests) arrive as tagged events on a single
/// channel, so transitions are evaluated in exactly one place.

use crate::engine::{EngineError, EngineEvent, Hypothesis, RecognitionEngine, SearchMode};
use crate::resolver::CommandResolver;
use crate::shared_state::SharedState;
use crate::speech::{CueTone, SpeechOutput};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Command window length
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Largest accepted best-score magnitude for a command hypothesis
pub const DEFAULT_CONFIDENCE_THRESHOLD: u32 = 2000;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Recognition engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Coordinator has been shut down")]
    ShutDown,

    #[error("Coordinator task failed: {0}")]
    Task(String),
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Passive wake-phrase spotting
    #[default]
    Spotting,

    /// Timed command grammar is active
    CommandListening,

    /// Terminal
    Shutdown,
}

impl CoordinatorState {
    pub fn description(&self) -> &'static str {
        match self {
            CoordinatorState::Spotting => "Listening for the wake phrase",
            CoordinatorState::CommandListening => "Listening for a command",
            CoordinatorState::Shutdown => "Shut down",
        }
    }

    /// Search mode whose events are current in this state
    fn expected_mode(&self) -> Option<SearchMode> {
        match self {
            CoordinatorState::Spotting => Some(SearchMode::Wake),
            CoordinatorState::CommandListening => Some(SearchMode::Command),
            CoordinatorState::Shutdown => None,
        }
    }
}

/// Coordinator tuning, supplied at startup
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Phrase that opens the command window
    pub wake_phrase: String,

    /// Command window length
    pub command_timeout: Duration,

    /// Largest accepted best-score magnitude
    pub confidence_threshold: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            wake_phrase: "robot".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub wake_triggers: u64,
    pub self_triggers_suppressed: u64,
    pub commands_dispatched: u64,
    pub low_confidence_discarded: u64,
    pub stale_events_discarded: u64,
    pub command_timeouts: u64,
    pub engine_errors: u64,
    pub replies_spoken: u64,
    pub resolver_failures: u64,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Event reported by the recognition engine
    Engine(EngineEvent),

    /// Command-window timer fired for `session`
    CommandTimeout { session: u64 },

    /// Stop recognition and release the engine
    Shutdown,
}

/// Sending half of the coordinator channel, safe to use from any thread
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl EventSink {
    /// Deliver an engine event. Returns false once the coordinator is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.push(CoordinatorEvent::Engine(event))
    }

    pub fn partial(&self, mode: SearchMode, hypothesis: Hypothesis) -> bool {
        self.send(EngineEvent::Partial { mode, hypothesis })
    }

    pub fn final_result(&self, mode: SearchMode, hypothesis: Hypothesis) -> bool {
        self.send(EngineEvent::Final { mode, hypothesis })
    }

    pub fn end_of_utterance(&self, mode: SearchMode) -> bool {
        self.send(EngineEvent::EndOfUtterance { mode })
    }

    pub fn timeout(&self, mode: SearchMode) -> bool {
        self.send(EngineEvent::Timeout { mode })
    }

    pub fn error(&self, mode: SearchMode, message: impl Into<String>) -> bool {
        self.send(EngineEvent::Error {
            mode,
            message: message.into(),
        })
    }

    pub fn request_shutdown(&self) -> bool {
        self.push(CoordinatorEvent::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, event: CoordinatorEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Receiving half of the coordinator channel
#[derive(Debug)]
pub struct EventInbox {
    rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

impl EventInbox {
    pub async fn recv(&mut self) -> Option<CoordinatorEvent> {
        self.rx.recv().await
    }
}

/// Create the coordinator channel.
///
/// Engine adapters are built with the sink before the coordinator exists.
pub fn event_channel() -> (EventSink, EventInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventInbox { rx })
}

/// Everything the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub state: Arc<SharedState>,
    pub engine: Arc<dyn RecognitionEngine>,
    pub resolver: Arc<dyn CommandResolver>,
    pub speech: Arc<SpeechOutput>,
    pub cue: Arc<dyn CueTone>,
}

struct Status {
    state: CoordinatorState,
    stats: CoordinatorStats,
}

/// Recognition state machine
pub struct VoiceCoordinator {
    settings: CoordinatorSettings,
    shared: Arc<SharedState>,
    engine: Arc<dyn RecognitionEngine>,
    resolver: Arc<dyn CommandResolver>,
    speech: Arc<SpeechOutput>,
    cue: Arc<dyn CueTone>,
    sink: EventSink,
    phase: CoordinatorState,
    session: u64,
    command_timer: Option<CancellationToken>,
    lifetime: CancellationToken,
    finished: CancellationToken,
    status: Arc<Mutex<Status>>,
}

impl VoiceCoordinator {
    pub fn new(settings: CoordinatorSettings, collaborators: Collaborators, sink: EventSink) -> Self {
        info!("Initializing voice coordinator");
        info!("Wake phrase: '{}'", settings.wake_phrase);
        info!(
            "Command timeout: {}ms, confidence threshold: {}",
            settings.command_timeout.as_millis(),
            settings.confidence_threshold
        );

        Self {
            settings,
            shared: collaborators.state,
            engine: collaborators.engine,
            resolver: collaborators.resolver,
            speech: collaborators.speech,
            cue: collaborators.cue,
            sink,
            phase: CoordinatorState::Spotting,
            session: 0,
            command_timer: None,
            lifetime: CancellationToken::new(),
            finished: CancellationToken::new(),
            status: Arc::new(Mutex::new(Status {
                state: CoordinatorState::Spotting,
                stats: CoordinatorStats::default(),
            })),
        }
    }

    /// Begin wake-phrase spotting
    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        if self.phase == CoordinatorState::Shutdown {
            return Err(CoordinatorError::ShutDown);
        }

        self.engine.start(SearchMode::Wake, None)?;
        info!("Voice coordinator started, waiting for '{}'", self.settings.wake_phrase);
        Ok(())
    }

    pub fn state(&self) -> CoordinatorState {
        self.phase
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.status.lock().stats.clone()
    }

    /// Command-window counter, bumped each time the window opens
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Evaluate one event against the current state
    pub fn handle_event(&mut self, event: CoordinatorEvent) {
        if self.phase == CoordinatorState::Shutdown {
            trace!("Ignoring {:?} after shutdown", event);
            return;
        }

        match event {
            CoordinatorEvent::Engine(event) => self.on_engine_event(event),
            CoordinatorEvent::CommandTimeout { session } => self.on_command_timeout(session),
            CoordinatorEvent::Shutdown => self.shutdown(),
        }
    }

    /// Cancel recognition, timers and pending replies, then release the engine.
    ///
    /// Calling this again is a no-op.
    pub fn shutdown(&mut self) {
        if self.phase == CoordinatorState::Shutdown {
            debug!("Coordinator already shut down");
            return;
        }

        info!("Shutting down voice coordinator");

        // Reply callbacks check this under the same lock before speaking
        self.status.lock().state = CoordinatorState::Shutdown;
        self.phase = CoordinatorState::Shutdown;

        self.cancel_command_timer();
        self.lifetime.cancel();

        self.engine.cancel();
        self.engine.shutdown();
        self.shared.set_listening(false);

        info!("Voice coordinator shut down");
    }

    /// Process events until shutdown
    pub async fn run(mut self, mut inbox: EventInbox) {
        while let Some(event) = inbox.recv().await {
            self.handle_event(event);

            if self.phase == CoordinatorState::Shutdown {
                break;
            }
        }

        self.shutdown();
        self.finished.cancel();
        debug!("Coordinator event loop exited");
    }

    /// Run the event loop on the current tokio runtime
    pub fn spawn(self, inbox: EventInbox) -> CoordinatorHandle {
        let sink = self.sink.clone();
        let status = self.status.clone();
        let finished = self.finished.clone();
        let task = tokio::spawn(self.run(inbox));

        CoordinatorHandle {
            sink,
            status,
            finished,
            task: Mutex::new(Some(task)),
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        let mode = event.mode();

        if self.phase.expected_mode() != Some(mode) {
            self.record(|stats| stats.stale_events_discarded += 1);

            match &event {
                EngineEvent::Error { message, .. } => {
                    warn!("Discarding error from stopped {} pass: {}", mode, message);
                }
                _ => debug!(
                    "Discarding late {} event from {} pass while {:?}",
                    event.kind(),
                    mode,
                    self.phase
                ),
            }
            return;
        }

        match (self.phase, event) {
            (CoordinatorState::Spotting, EngineEvent::Partial { hypothesis, .. }) => {
                self.on_wake_partial(&hypothesis);
            }
            (CoordinatorState::CommandListening, EngineEvent::Final { hypothesis, .. }) => {
                self.on_command_result(hypothesis);
            }
            (CoordinatorState::CommandListening, EngineEvent::EndOfUtterance { .. }) => {
                debug!("End of utterance without a usable command");
                self.leave_command_mode();
            }
            (CoordinatorState::CommandListening, EngineEvent::Timeout { .. }) => {
                info!("Command window timed out (engine)");
                self.record(|stats| stats.command_timeouts += 1);
                self.leave_command_mode();
            }
            (phase, EngineEvent::Error { mode, message }) => {
                error!("Recognition engine error in {} mode: {}", mode, message);
                self.record(|stats| stats.engine_errors += 1);

                if phase == CoordinatorState::CommandListening {
                    self.leave_command_mode();
                }
            }
            (phase, event) => {
                trace!("No transition for {} event in {:?}", event.kind(), phase);
            }
        }
    }

    fn on_wake_partial(&mut self, hypothesis: &Hypothesis) {
        if hypothesis.text.trim() != self.settings.wake_phrase {
            return;
        }

        if self.shared.is_speaking() {
            debug!("Heard the wake phrase while speaking, ignoring own voice");
            self.record(|stats| stats.self_triggers_suppressed += 1);
            return;
        }

        self.enter_command_mode();
    }

    fn enter_command_mode(&mut self) {
        info!("Wake phrase detected, starting command search");

        self.engine.stop();
        self.shared.set_listening(true);

        if let Err(e) = self
            .engine
            .start(SearchMode::Command, Some(self.settings.command_timeout))
        {
            error!("Failed to start command search: {}", e);
            self.record(|stats| stats.engine_errors += 1);
            self.shared.set_listening(false);
            self.restart_wake_search();
            return;
        }

        self.session += 1;
        self.set_phase(CoordinatorState::CommandListening);
        self.arm_command_timer();
        self.record(|stats| stats.wake_triggers += 1);
        self.cue.play();
    }

    fn on_command_result(&mut self, hypothesis: Hypothesis) {
        if !hypothesis.is_confident(self.settings.confidence_threshold) {
            debug!(
                "Discarding low-confidence result '{}' (score {})",
                hypothesis.text, hypothesis.best_score
            );
            self.record(|stats| stats.low_confidence_discarded += 1);
            return;
        }

        info!(
            "score: {}, prob: {}, result: {}",
            hypothesis.best_score, hypothesis.probability, hypothesis.text
        );

        self.leave_command_mode();
        self.dispatch(hypothesis.text);
    }

    fn on_command_timeout(&mut self, session: u64) {
        if self.phase != CoordinatorState::CommandListening || session != self.session {
            trace!("Ignoring timer of finished command session {}", session);
            return;
        }

        info!("Command window timed out");
        self.record(|stats| stats.command_timeouts += 1);
        self.leave_command_mode();
    }

    fn leave_command_mode(&mut self) {
        self.cancel_command_timer();
        self.shared.set_listening(false);
        self.set_phase(CoordinatorState::Spotting);
        self.restart_wake_search();
    }

    fn restart_wake_search(&mut self) {
        self.engine.stop();

        match self.engine.start(SearchMode::Wake, None) {
            Ok(()) => debug!("Wake search restarted"),
            Err(e) => {
                error!("Failed to restart wake search: {}", e);
                self.record(|stats| stats.engine_errors += 1);
            }
        }
    }

    fn arm_command_timer(&mut self) {
        self.cancel_command_timer();

        let token = self.lifetime.child_token();
        let guard = token.clone();
        let sink = self.sink.clone();
        let session = self.session;
        let timeout = self.settings.command_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {
                    trace!("Command timer {} cancelled", session);
                }
                _ = tokio::time::sleep(timeout) => {
                    sink.push(CoordinatorEvent::CommandTimeout { session });
                }
            }
        });

        self.command_timer = Some(token);
    }

    fn cancel_command_timer(&mut self) {
        if let Some(timer) = self.command_timer.take() {
            timer.cancel();
        }
    }

    /// Fire-and-forget round trip to the resolver
    fn dispatch(&mut self, command: String) {
        self.record(|stats| stats.commands_dispatched += 1);
        info!("Dispatching command '{}'", command);

        let resolver = self.resolver.clone();
        let speech = self.speech.clone();
        let status = self.status.clone();
        let lifetime = self.lifetime.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = lifetime.cancelled() => {
                    debug!("Dropping pending reply for '{}' after shutdown", command);
                    return;
                }
                result = resolver.resolve(&command) => result,
            };

            let mut status = status.lock();
            if status.state == CoordinatorState::Shutdown {
                debug!("Dropping reply for '{}' after shutdown", command);
                return;
            }

            match result {
                Ok(reply) => {
                    info!("Reply for '{}': {}", command, reply);
                    speech.speak(reply);
                    status.stats.replies_spoken += 1;
                }
                Err(e) => {
                    error!("Error getting command response for '{}': {}", command, e);
                    status.stats.resolver_failures += 1;
                }
            }
        });
    }

    fn set_phase(&mut self, phase: CoordinatorState) {
        if self.phase != phase {
            debug!("{:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
        self.status.lock().state = phase;
    }

    fn record(&self, update: impl FnOnce(&mut CoordinatorStats)) {
        update(&mut self.status.lock().stats);
    }
}

/// Handle to a coordinator running on its own task
pub struct CoordinatorHandle {
    sink: EventSink,
    status: Arc<Mutex<Status>>,
    finished: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// Sink for engine adapters and tests
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.status.lock().state
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.status.lock().stats.clone()
    }

    /// Shut the coordinator down and wait until the engine is released.
    ///
    /// Idempotent. Concurrent callers all return only once shutdown is complete.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.sink.request_shutdown();

        let task = self.task.lock().take();

        if let Some(task) = task {
            let result = task.await;

            // A panicked task never reaches the end of its loop
            self.finished.cancel();
            return result.map_err(|e| CoordinatorError::Task(e.to_string()));
        }

        debug!("Coordinator shutdown already in progress, waiting");
        self.finished.cancelled().await;
        Ok(())
    }

    /// Whether the coordinator has fully shut down
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockRecognitionEngine;
    use crate::resolver::{MockCommandResolver, ResolverError};
    use crate::speech::{MockCueTone, SilentCue, SynthesisError, Synthesizer};
    use async_trait::async_trait;
    use mockall::predicate::eq;

    #[derive(Default)]
    struct SpokenLog(Mutex<Vec<String>>);

    #[async_trait]
    impl Synthesizer for SpokenLog {
        async fn synthesize(&self, text: &str) -> Result<(), SynthesisError> {
            self.0.lock().push(text.to_string());
            Ok(())
        }
    }

    fn permissive_engine() -> MockRecognitionEngine {
        let mut engine = MockRecognitionEngine::new();
        engine.expect_start().returning(|_, _| Ok(()));
        engine.expect_stop().returning(|| ());
        engine.expect_cancel().returning(|| ());
        engine.expect_shutdown().returning(|| ());
        engine.expect_current_mode().returning(|| None);
        engine
    }

    fn echo_resolver() -> MockCommandResolver {
        let mut resolver = MockCommandResolver::new();
        resolver
            .expect_resolve()
            .returning(|request| Ok(format!("done: {}", request)));
        resolver
    }

    struct Fixture {
        coordinator: VoiceCoordinator,
        state: Arc<SharedState>,
        spoken: Arc<SpokenLog>,
    }

    fn fixture(engine: MockRecognitionEngine, resolver: MockCommandResolver) -> Fixture {
        fixture_with(engine, resolver, Arc::new(SilentCue), CoordinatorSettings::default())
    }

    fn fixture_with(
        engine: MockRecognitionEngine,
        resolver: MockCommandResolver,
        cue: Arc<dyn CueTone>,
        settings: CoordinatorSettings,
    ) -> Fixture {
        let state = Arc::new(SharedState::new());
        let spoken = Arc::new(SpokenLog::default());
        let speech = Arc::new(SpeechOutput::spawn(spoken.clone(), state.clone()));
        let (sink, _inbox) = event_channel();

        let coordinator = VoiceCoordinator::new(
            settings,
            Collaborators {
                state: state.clone(),
                engine: Arc::new(engine),
                resolver: Arc::new(resolver),
                speech,
                cue,
            },
            sink,
        );

        Fixture {
            coordinator,
            state,
            spoken,
        }
    }

    fn wake() -> CoordinatorEvent {
        CoordinatorEvent::Engine(EngineEvent::Partial {
            mode: SearchMode::Wake,
            hypothesis: Hypothesis::new("robot", -300, 0),
        })
    }

    fn command(text: &str, score: i32) -> CoordinatorEvent {
        CoordinatorEvent::Engine(EngineEvent::Final {
            mode: SearchMode::Command,
            hypothesis: Hypothesis::new(text, score, -12),
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_wake_phrase_opens_command_window() {
        let mut engine = MockRecognitionEngine::new();
        let mut seq = mockall::Sequence::new();
        engine.expect_stop().times(1).in_sequence(&mut seq).returning(|| ());
        engine
            .expect_start()
            .with(eq(SearchMode::Command), eq(Some(DEFAULT_COMMAND_TIMEOUT)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut cue = MockCueTone::new();
        cue.expect_play().times(1).returning(|| ());

        let mut f = fixture_with(
            engine,
            MockCommandResolver::new(),
            Arc::new(cue),
            CoordinatorSettings::default(),
        );

        f.coordinator.handle_event(wake());

        assert_eq!(f.coordinator.state(), CoordinatorState::CommandListening);
        assert!(f.state.is_listening());
        assert_eq!(f.coordinator.session(), 1);
        assert_eq!(f.coordinator.stats().wake_triggers, 1);
    }

    #[tokio::test]
    async fn test_wake_phrase_ignored_while_speaking() {
        let mut engine = MockRecognitionEngine::new();
        engine.expect_start().never();
        engine.expect_stop().never();

        let mut f = fixture(engine, MockCommandResolver::new());
        f.state.set_speaking(true);

        f.coordinator.handle_event(wake());

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(!f.state.is_listening());
        assert_eq!(f.coordinator.stats().self_triggers_suppressed, 1);
    }

    #[tokio::test]
    async fn test_other_partials_do_not_trigger() {
        let mut engine = MockRecognitionEngine::new();
        engine.expect_start().never();

        let mut f = fixture(engine, MockCommandResolver::new());
        f.coordinator
            .handle_event(CoordinatorEvent::Engine(EngineEvent::Partial {
                mode: SearchMode::Wake,
                hypothesis: Hypothesis::new("robots", -100, 0),
            }));

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
    }

    #[tokio::test]
    async fn test_confident_result_is_dispatched_and_spoken() {
        let mut f = fixture(permissive_engine(), echo_resolver());

        f.coordinator.handle_event(wake());
        f.coordinator.handle_event(command("turn on lights", -500));

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(!f.state.is_listening());

        let spoken = f.spoken.clone();
        wait_for(|| spoken.0.lock().len() == 1).await;
        assert_eq!(spoken.0.lock()[0], "done: turn on lights");
        assert_eq!(f.coordinator.stats().commands_dispatched, 1);
        assert_eq!(f.coordinator.stats().replies_spoken, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_result_is_discarded() {
        let mut resolver = MockCommandResolver::new();
        resolver.expect_resolve().never();

        let mut f = fixture(permissive_engine(), resolver);

        f.coordinator.handle_event(wake());
        f.coordinator.handle_event(command("turn on lights", -2500));

        assert_eq!(f.coordinator.state(), CoordinatorState::CommandListening);
        assert!(f.state.is_listening());
        assert_eq!(f.coordinator.stats().low_confidence_discarded, 1);
        assert_eq!(f.coordinator.stats().commands_dispatched, 0);
    }

    #[tokio::test]
    async fn test_resolver_failure_logs_without_reply() {
        let mut resolver = MockCommandResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_| Err(ResolverError::Unavailable("no service".to_string())));

        let mut f = fixture(permissive_engine(), resolver);
        f.coordinator.handle_event(wake());
        f.coordinator.handle_event(command("sing", -10));

        let status = f.coordinator.status.clone();
        wait_for(|| status.lock().stats.resolver_failures == 1).await;

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(f.spoken.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_utterance_returns_to_spotting() {
        let mut f = fixture(permissive_engine(), MockCommandResolver::new());

        f.coordinator.handle_event(wake());
        f.coordinator
            .handle_event(CoordinatorEvent::Engine(EngineEvent::EndOfUtterance {
                mode: SearchMode::Command,
            }));

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(!f.state.is_listening());
    }

    #[tokio::test]
    async fn test_error_in_command_mode_fails_safe() {
        let mut f = fixture(permissive_engine(), MockCommandResolver::new());

        f.coordinator.handle_event(wake());
        f.coordinator
            .handle_event(CoordinatorEvent::Engine(EngineEvent::Error {
                mode: SearchMode::Command,
                message: "audio device lost".to_string(),
            }));

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(!f.state.is_listening());
        assert_eq!(f.coordinator.stats().engine_errors, 1);
    }

    #[tokio::test]
    async fn test_late_events_are_discarded() {
        let mut resolver = MockCommandResolver::new();
        resolver.expect_resolve().never();

        let mut f = fixture(permissive_engine(), resolver);

        // Command-mode result while spotting
        f.coordinator.handle_event(command("turn on lights", -100));
        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);

        // Wake-mode partial once the command window is open
        f.coordinator.handle_event(wake());
        f.coordinator.handle_event(wake());
        assert_eq!(f.coordinator.session(), 1);

        assert_eq!(f.coordinator.stats().stale_events_discarded, 2);
    }

    #[tokio::test]
    async fn test_result_after_end_of_utterance_is_dropped() {
        let mut resolver = MockCommandResolver::new();
        resolver.expect_resolve().never();

        let mut f = fixture(permissive_engine(), resolver);

        f.coordinator.handle_event(wake());
        f.coordinator
            .handle_event(CoordinatorEvent::Engine(EngineEvent::EndOfUtterance {
                mode: SearchMode::Command,
            }));

        // Hypothesis flushed by stopping the command pass
        f.coordinator.handle_event(command("turn on lights", -500));

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert_eq!(f.coordinator.stats().commands_dispatched, 0);
        assert_eq!(f.coordinator.stats().stale_events_discarded, 1);
    }

    #[tokio::test]
    async fn test_stale_timer_is_ignored() {
        let mut f = fixture(permissive_engine(), echo_resolver());

        f.coordinator.handle_event(wake());
        f.coordinator.handle_event(command("hello", -1));
        f.coordinator.handle_event(wake());
        assert_eq!(f.coordinator.session(), 2);

        f.coordinator
            .handle_event(CoordinatorEvent::CommandTimeout { session: 1 });
        assert_eq!(f.coordinator.state(), CoordinatorState::CommandListening);

        f.coordinator
            .handle_event(CoordinatorEvent::CommandTimeout { session: 2 });
        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert_eq!(f.coordinator.stats().command_timeouts, 1);
    }

    #[tokio::test]
    async fn test_failed_command_start_stays_spotting() {
        let mut engine = MockRecognitionEngine::new();
        engine.expect_stop().returning(|| ());
        engine
            .expect_start()
            .with(eq(SearchMode::Command), mockall::predicate::always())
            .returning(|mode, _| {
                Err(EngineError::Start {
                    mode,
                    reason: "grammar missing".to_string(),
                })
            });
        engine
            .expect_start()
            .with(eq(SearchMode::Wake), eq(None))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut f = fixture(engine, MockCommandResolver::new());
        f.coordinator.handle_event(wake());

        assert_eq!(f.coordinator.state(), CoordinatorState::Spotting);
        assert!(!f.state.is_listening());
        assert_eq!(f.coordinator.stats().engine_errors, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut engine = MockRecognitionEngine::new();
        engine.expect_start().returning(|_, _| Ok(()));
        engine.expect_stop().returning(|| ());
        engine.expect_cancel().times(1).returning(|| ());
        engine.expect_shutdown().times(1).returning(|| ());

        let mut f = fixture(engine, MockCommandResolver::new());
        f.coordinator.handle_event(wake());

        f.coordinator.shutdown();
        f.coordinator.shutdown();
        f.coordinator.handle_event(CoordinatorEvent::Shutdown);
        f.coordinator.handle_event(wake());

        assert_eq!(f.coordinator.state(), CoordinatorState::Shutdown);
        assert!(!f.state.is_listening());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let mut f = fixture(permissive_engine(), MockCommandResolver::new());
        f.coordinator.shutdown();

        assert!(matches!(f.coordinator.start(), Err(CoordinatorError::ShutDown)));
    }
}
