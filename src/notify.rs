/// Non-urgent spoken notifications
///
/// Low-priority announcements go through `NotificationGate`, which drops
/// them during quiet hours. The battery monitor is the main producer.

use crate::shared_state::SharedState;
use crate::speech::SpeechOutput;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Battery level below which the head asks to be charged
pub const DEFAULT_LOW_BATTERY_PERCENT: u8 = 15;

pub const DEFAULT_LOW_BATTERY_MESSAGE: &str = "charge me";

/// Gate in front of the speech output for non-urgent announcements
pub struct NotificationGate {
    state: Arc<SharedState>,
    speech: Arc<SpeechOutput>,
}

impl NotificationGate {
    pub fn new(state: Arc<SharedState>, speech: Arc<SpeechOutput>) -> Self {
        Self { state, speech }
    }

    /// Speak `text` unless it is quiet time or a command is being listened for.
    ///
    /// Suppressed notifications are dropped, not deferred. Returns whether
    /// the text was handed to the speech output.
    pub fn notify(&self, text: &str) -> bool {
        if !self.state.can_notify() {
            debug!("Quiet hours, suppressing notification '{}'", text);
            return false;
        }

        if self.state.is_listening() {
            debug!("Command window open, suppressing notification '{}'", text);
            return false;
        }

        info!("Notification: {}", text);
        self.speech.speak(text);
        true
    }
}

/// Platform charge status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    #[default]
    Unknown,
    Charging,
    Discharging,
    NotCharging,
    Full,
}

impl ChargeState {
    /// Map the platform's numeric status code
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => ChargeState::Charging,
            3 => ChargeState::Discharging,
            4 => ChargeState::NotCharging,
            5 => ChargeState::Full,
            _ => ChargeState::Unknown,
        }
    }

    /// Plugged in and either charging or full
    pub fn is_charging(&self) -> bool {
        matches!(self, ChargeState::Charging | ChargeState::Full)
    }
}

/// Raw battery broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub level: i32,
    pub scale: i32,
    pub status: ChargeState,
}

impl BatteryReading {
    pub fn new(level: i32, scale: i32, status: ChargeState) -> Self {
        Self {
            level,
            scale,
            status,
        }
    }

    /// Percentage and charging flag, or `None` for a malformed reading
    pub fn to_status(&self) -> Option<BatteryStatus> {
        if self.scale <= 0 || self.level < 0 {
            return None;
        }

        let percent = (self.level as f32 * 100.0 / self.scale as f32).round();

        Some(BatteryStatus {
            percent: percent.min(100.0) as u8,
            charging: self.status.is_charging(),
        })
    }
}

/// Battery status as published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub percent: u8,
    pub charging: bool,
}

impl BatteryStatus {
    pub fn label(&self) -> &'static str {
        if self.charging {
            "charging"
        } else {
            "discharging"
        }
    }
}

/// Turns battery broadcasts into a status and a low-battery notification
pub struct BatteryMonitor {
    gate: Arc<NotificationGate>,
    low_percent: u8,
    low_message: String,
    last: Mutex<Option<BatteryStatus>>,
}

impl BatteryMonitor {
    pub fn new(gate: Arc<NotificationGate>, low_percent: u8, low_message: impl Into<String>) -> Self {
        Self {
            gate,
            low_percent,
            low_message: low_message.into(),
            last: Mutex::new(None),
        }
    }

    /// Handle one broadcast. Every reading below the threshold asks for a charge.
    pub fn on_reading(&self, reading: BatteryReading) -> Option<BatteryStatus> {
        let Some(status) = reading.to_status() else {
            warn!("Ignoring malformed battery reading {:?}", reading);
            return None;
        };

        info!("Battery {}% ({})", status.percent, status.label());
        *self.last.lock() = Some(status);

        if status.percent < self.low_percent {
            self.gate.notify(&self.low_message);
        }

        Some(status)
    }

    pub fn last_status(&self) -> Option<BatteryStatus> {
        *self.last.lock()
    }
}
