use std::time::Duration;

use crate::reaper::ReaperSettings;
use crate::retry::RetryPolicy;
use crate::timer::TimerSettings;
use crate::visibility::VisibilityPolicy;

pub const DEFAULT_MAX_MESSAGE_LEN: usize = 500;
pub const DEFAULT_CLOCK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub timer: TimerSettings,
    pub reaper: ReaperSettings,
    pub visibility: VisibilityPolicy,
    /// In characters, after trimming.
    pub max_message_len: usize,
    /// Period of the server-side session clock. `None` leaves ticking to
    /// the caller.
    pub clock_period: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timer: TimerSettings::default(),
            reaper: ReaperSettings::default(),
            visibility: VisibilityPolicy::default(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            clock_period: Some(DEFAULT_CLOCK_PERIOD),
        }
    }
}
