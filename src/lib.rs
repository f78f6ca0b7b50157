/// Robot head voice interaction
///
/// Control logic between a speech recognizer and a voice synthesizer:
/// - Continuous wake-phrase spotting with a time-boxed command window
/// - Self-trigger suppression while the head is speaking
/// - Fire-and-forget command resolution with spoken replies
/// - Quiet-hours gating for non-urgent notifications

pub mod config;
pub mod console;
pub mod coordinator;
pub mod engine;
pub mod notify;
pub mod resolver;
pub mod shared_state;
pub mod speech;

// Re-export main types
pub use config::{BatteryConfig, ConfigError, QuietHoursConfig, VoiceConfig};
pub use coordinator::{
    event_channel, Collaborators, CoordinatorError, CoordinatorEvent, CoordinatorHandle,
    CoordinatorSettings, CoordinatorState, CoordinatorStats, EventInbox, EventSink,
    VoiceCoordinator,
};
pub use engine::{EngineError, EngineEvent, EngineSettings, Hypothesis, RecognitionEngine, SearchMode};
pub use notify::{BatteryMonitor, BatteryReading, BatteryStatus, ChargeState, NotificationGate};
pub use resolver::{CommandResolver, ResolverError, StaticCommandResolver};
pub use shared_state::{Clock, LocalClock, QuietHours, SharedState, SpeakingResolver};
pub use speech::{CueTone, SilentCue, SpeechOutput, SynthesisError, Synthesizer};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging, `RUST_LOG` wins over `default_filter`
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
