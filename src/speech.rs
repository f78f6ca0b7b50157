/// Speech output module
///
/// Wraps the external synthesizer with a one-slot flush queue and keeps
/// `SharedState.speaking` honest so the recognizer can ignore the head's own voice.

use crate::shared_state::{SharedState, SpeakingResolver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Synthesizer not ready: {0}")]
    NotReady(String),

    #[error("Synthesis failed: {0}")]
    Failed(String),
}

/// Text-to-speech engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Speak `text`, completing once playback has finished.
    ///
    /// Dropping the returned future must silence the utterance.
    async fn synthesize(&self, text: &str) -> Result<(), SynthesisError>;

    /// Native "is currently speaking" query, if the synthesizer has one
    fn busy_resolver(&self) -> Option<SpeakingResolver> {
        None
    }
}

/// Short audible cue played when the head starts listening for a command
#[cfg_attr(test, mockall::automock)]
pub trait CueTone: Send + Sync {
    fn play(&self);
}

/// Cue that plays nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCue;

impl CueTone for SilentCue {
    fn play(&self) {}
}

/// Speech output with at most one audible utterance
pub struct SpeechOutput {
    state: Arc<SharedState>,
    queue: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<usize>>,
    manual_flag: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpeechOutput {
    /// Start the speech worker on the current tokio runtime.
    ///
    /// If the synthesizer exposes a busy query it becomes the shared
    /// speaking resolver and the flag is never toggled by hand.
    pub fn spawn(synthesizer: Arc<dyn Synthesizer>, state: Arc<SharedState>) -> Self {
        let manual_flag = match synthesizer.busy_resolver() {
            Some(resolver) => {
                state.set_speaking_resolver(resolver);
                info!("Speaking state follows the synthesizer busy query");
                false
            }
            None => {
                info!("Speaking state toggled around each utterance");
                true
            }
        };

        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(0));

        let worker = tokio::spawn(run_worker(
            synthesizer,
            state.clone(),
            rx,
            pending.clone(),
            manual_flag,
        ));

        Self {
            state,
            queue,
            pending,
            manual_flag,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `text`, replacing anything queued or currently audible
    pub fn speak(&self, text: impl Into<String>) {
        let text = text.into();

        if self.worker.lock().is_none() {
            warn!("Speech output stopped, dropping utterance '{}'", text);
            return;
        }

        {
            let mut pending = self.pending.lock();
            *pending += 1;
            if self.manual_flag {
                self.state.set_speaking(true);
            }
        }

        debug!("Queued utterance '{}'", text);

        if self.queue.send(text).is_err() {
            warn!("Speech worker stopped, dropping utterance");
            finish_utterance(&self.state, &self.pending, self.manual_flag);
        }
    }

    /// Utterances queued or playing
    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    pub fn uses_speaking_resolver(&self) -> bool {
        !self.manual_flag
    }

    /// Stop the worker, silencing any current utterance
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            info!("Speech output stopped");
        }

        *self.pending.lock() = 0;
        if self.manual_flag {
            self.state.set_speaking(false);
        }
    }
}

impl Drop for SpeechOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(
    synthesizer: Arc<dyn Synthesizer>,
    state: Arc<SharedState>,
    mut queue: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<usize>>,
    manual_flag: bool,
) {
    let mut next: Option<String> = None;

    loop {
        let mut text = match next.take() {
            Some(text) => text,
            None => match queue.recv().await {
                Some(text) => text,
                None => break,
            },
        };

        // Flush: only the newest queued utterance is spoken
        while let Ok(newer) = queue.try_recv() {
            debug!("Flushing queued utterance '{}'", text);
            finish_utterance(&state, &pending, manual_flag);
            text = newer;
        }

        info!("Speaking: {}", text);

        tokio::select! {
            result = synthesizer.synthesize(&text) => {
                if let Err(e) = result {
                    warn!("Speech synthesis failed: {}", e);
                }
            }
            newer = queue.recv() => {
                if let Some(newer) = newer {
                    debug!("Interrupted utterance '{}'", text);
                    next = Some(newer);
                }
            }
        }

        finish_utterance(&state, &pending, manual_flag);
    }

    debug!("Speech worker exited");
}

fn finish_utterance(state: &SharedState, pending: &Mutex<usize>, manual_flag: bool) {
    let mut pending = pending.lock();
    *pending = pending.saturating_sub(1);

    if *pending == 0 && manual_flag {
        state.set_speaking(false);
    }
}
