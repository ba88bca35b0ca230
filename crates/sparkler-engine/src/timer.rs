//! Per-participant burn timers.
//!
//! Pure state: no clocks, no I/O. [`crate::session`] owns two of these per
//! room and decides when the session ends.

use std::time::Duration;

use sparkler_types::models::TimerView;

/// Upper bound for a single tick's burn multiplier.
pub const MAX_DECAY: f64 = 16.0;

/// Scales the burn rate applied by one tick. Supplied from outside the
/// engine, e.g. a device motion sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayMultiplier(f64);

impl DecayMultiplier {
    pub const NEUTRAL: Self = Self(1.0);

    /// `None` unless `value` is finite and within `[0, MAX_DECAY]`.
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=MAX_DECAY).contains(&value)).then_some(Self(value))
    }

    /// Tilt in `[0, 1]` burns up to 50% faster. Out-of-range tilt is clamped.
    pub fn from_tilt(tilt: f64) -> Self {
        let tilt = if tilt.is_finite() { tilt.clamp(0.0, 1.0) } else { 0.0 };
        Self(1.0 + tilt * 0.5)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for DecayMultiplier {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// When does a two-sided session end?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// Only once both sides are out of time. One side at zero keeps the
    /// session alive while the other still burns.
    #[default]
    Joint,
    /// As soon as either side runs out.
    FirstToZero,
}

impl TerminationPolicy {
    pub fn should_end(self, timers: &[TimerState; 2]) -> bool {
        match self {
            Self::Joint => timers.iter().all(TimerState::is_exhausted),
            Self::FirstToZero => timers.iter().any(TimerState::is_exhausted),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "joint" => Some(Self::Joint),
            "first-to-zero" | "first_to_zero" => Some(Self::FirstToZero),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimerSettings {
    /// Burn time each side starts with.
    pub initial: Duration,
    /// Handle length: `remaining` never exceeds this.
    pub max: Duration,
    /// Time added by one extension (capped at `max`).
    pub extension: Duration,
    /// Wait imposed after each successful extension.
    pub cooldown: Duration,
    /// Per-side extension budget; `None` is unlimited.
    pub max_extensions: Option<u32>,
    pub termination: TerminationPolicy,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(120),
            extension: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
            max_extensions: None,
            termination: TerminationPolicy::Joint,
        }
    }
}

/// One side's burn timer. `remaining <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    pub remaining: Duration,
    pub max: Duration,
    pub cooldown: Duration,
    pub extensions_used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionResult {
    Granted { added: Duration, state: TimerState },
    OnCooldown { cooldown: Duration },
    AtCapacity,
    LimitReached,
}

impl TimerState {
    pub fn new(settings: &TimerSettings) -> Self {
        Self {
            remaining: settings.initial.min(settings.max),
            max: settings.max,
            cooldown: Duration::ZERO,
            extensions_used: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_zero()
    }

    /// Burn `elapsed × decay` off `remaining` and `elapsed` off the cooldown,
    /// both floored at zero.
    pub fn burn(&mut self, elapsed: Duration, decay: DecayMultiplier) {
        let burned = Duration::try_from_secs_f64(elapsed.as_secs_f64() * decay.value())
            .unwrap_or(Duration::MAX);
        self.remaining = self.remaining.saturating_sub(burned);
        self.cooldown = self.cooldown.saturating_sub(elapsed);
    }

    /// Extend if off cooldown and below capacity. Denials leave the state untouched.
    pub fn try_extend(&mut self, settings: &TimerSettings) -> ExtensionResult {
        if !self.cooldown.is_zero() {
            return ExtensionResult::OnCooldown {
                cooldown: self.cooldown,
            };
        }
        if self.remaining >= self.max {
            return ExtensionResult::AtCapacity;
        }
        if settings
            .max_extensions
            .is_some_and(|limit| self.extensions_used >= limit)
        {
            return ExtensionResult::LimitReached;
        }

        let added = settings.extension.min(self.max - self.remaining);
        self.remaining += added;
        self.cooldown = settings.cooldown;
        self.extensions_used += 1;
        ExtensionResult::Granted {
            added,
            state: *self,
        }
    }

    pub fn view(&self) -> TimerView {
        TimerView {
            remaining_ms: millis(self.remaining),
            max_ms: millis(self.max),
            cooldown_ms: millis(self.cooldown),
            extensions_used: self.extensions_used,
        }
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
