/// Shared coordination state
///
/// Process-wide `speaking` / `listening` flags plus the quiet-hours gate.
/// Recognizer callbacks, reply callbacks, the speech worker and notification
/// producers all read and write through here, one short critical section per call.

use chrono::Timelike;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Quiet window starts at this hour (inclusive)
pub const DEFAULT_QUIET_FROM_HOUR: u32 = 22;

/// Quiet window ends at this hour (exclusive)
pub const DEFAULT_QUIET_TO_HOUR: u32 = 9;

/// Dynamic "is speaking" predicate, e.g. a synthesizer's own busy query.
///
/// Must be cheap and must not block.
pub type SpeakingResolver = Arc<dyn Fn() -> bool + Send + Sync>;

/// Source of the local hour of day
pub trait Clock: Send + Sync {
    /// Current local hour, `0..24`
    fn current_hour(&self) -> u32;
}

/// Wall clock in the local time zone
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn current_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// Nightly silence window, hour-of-day granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    /// First quiet hour (inclusive)
    pub from_hour: u32,

    /// First hour after the window (exclusive)
    pub to_hour: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            from_hour: DEFAULT_QUIET_FROM_HOUR,
            to_hour: DEFAULT_QUIET_TO_HOUR,
        }
    }
}

impl QuietHours {
    pub fn new(from_hour: u32, to_hour: u32) -> Self {
        Self { from_hour, to_hour }
    }

    /// Whether `hour` falls inside the window.
    ///
    /// A window with `from_hour > to_hour` wraps midnight. Equal bounds mean
    /// the window is empty.
    pub fn is_quiet(&self, hour: u32) -> bool {
        let hour = hour % 24;

        match self.from_hour.cmp(&self.to_hour) {
            Ordering::Greater => hour >= self.from_hour || hour < self.to_hour,
            Ordering::Less => hour >= self.from_hour && hour < self.to_hour,
            Ordering::Equal => false,
        }
    }
}

struct Flags {
    speaking: bool,
    listening: bool,
    speaking_resolver: Option<SpeakingResolver>,
}

/// Single source of truth for "is the head talking / listening right now"
pub struct SharedState {
    flags: Mutex<Flags>,
    quiet_hours: QuietHours,
    clock: Box<dyn Clock>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Create state with the default 22:00 - 09:00 quiet window
    pub fn new() -> Self {
        Self::with_quiet_hours(QuietHours::default())
    }

    pub fn with_quiet_hours(quiet_hours: QuietHours) -> Self {
        Self::with_clock(quiet_hours, LocalClock)
    }

    /// Create state with an explicit clock (tests, simulated time)
    pub fn with_clock(quiet_hours: QuietHours, clock: impl Clock + 'static) -> Self {
        debug!(
            "Shared state created, quiet hours {:02}:00-{:02}:00",
            quiet_hours.from_hour, quiet_hours.to_hour
        );

        Self {
            flags: Mutex::new(Flags {
                speaking: false,
                listening: false,
                speaking_resolver: None,
            }),
            quiet_hours,
            clock: Box::new(clock),
        }
    }

    /// `speaking` flag OR the installed resolver.
    ///
    /// The resolver runs after the lock is released so it may itself read
    /// this state without deadlocking.
    pub fn is_speaking(&self) -> bool {
        let (speaking, resolver) = {
            let flags = self.flags.lock();
            (flags.speaking, flags.speaking_resolver.clone())
        };

        speaking || resolver.map_or(false, |resolve| resolve())
    }

    pub fn is_listening(&self) -> bool {
        self.flags.lock().listening
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.flags.lock().speaking = speaking;
        trace!("speaking = {}", speaking);
    }

    pub fn set_listening(&self, listening: bool) {
        self.flags.lock().listening = listening;
        trace!("listening = {}", listening);
    }

    /// Install a dynamic speaking predicate, replacing any previous one
    pub fn set_speaking_resolver(&self, resolver: SpeakingResolver) {
        let replaced = self.flags.lock().speaking_resolver.replace(resolver).is_some();
        debug!("Speaking resolver installed (replaced previous: {})", replaced);
    }

    pub fn clear_speaking_resolver(&self) {
        self.flags.lock().speaking_resolver = None;
    }

    pub fn has_speaking_resolver(&self) -> bool {
        self.flags.lock().speaking_resolver.is_some()
    }

    /// True outside the quiet window
    pub fn can_notify(&self) -> bool {
        self.can_notify_at(self.clock.current_hour())
    }

    /// `can_notify` evaluated for a given hour of day
    pub fn can_notify_at(&self, hour: u32) -> bool {
        !self.quiet_hours.is_quiet(hour)
    }

    pub fn quiet_hours(&self) -> QuietHours {
        self.quiet_hours
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags.lock();
        f.debug_struct("SharedState")
            .field("speaking", &flags.speaking)
            .field("listening", &flags.listening)
            .field("speaking_resolver", &flags.speaking_resolver.is_some())
            .field("quiet_hours", &self.quiet_hours)
            .finish()
    }
}
