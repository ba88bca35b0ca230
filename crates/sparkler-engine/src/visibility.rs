//! Which messages of a room log are currently presentable.
//!
//! A read-time projection: the stored log is never touched.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use sparkler_types::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityPolicy {
    /// The `count` most recent messages by sequence.
    Windowed { count: usize },
    /// Each message for `ttl` after its timestamp.
    Timed { ttl: Duration },
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self::Windowed { count: 6 }
    }
}

impl VisibilityPolicy {
    /// Visible messages in sequence order. `messages` may arrive in any order.
    pub fn visible<'a>(&self, messages: &'a [Message], now: DateTime<Utc>) -> Vec<&'a Message> {
        let mut ordered: Vec<&Message> = messages.iter().collect();
        ordered.sort_by_key(|m| m.sequence);

        match *self {
            Self::Windowed { count } => {
                let skip = ordered.len().saturating_sub(count);
                ordered.split_off(skip)
            }
            Self::Timed { ttl } => {
                let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                ordered
                    .into_iter()
                    .filter(|m| {
                        m.timestamp
                            .checked_add_signed(ttl)
                            .is_none_or(|expires| now < expires)
                    })
                    .collect()
            }
        }
    }
}

impl FromStr for VisibilityPolicy {
    type Err = String;

    /// `windowed:<count>` or `timed:<seconds>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <kind>:<value>, got '{}'", s))?;
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|e| format!("bad visibility value '{}': {}", value, e))?;

        match kind.trim() {
            "windowed" => Ok(Self::Windowed {
                count: usize::try_from(value).map_err(|e| e.to_string())?,
            }),
            "timed" => Ok(Self::Timed {
                ttl: Duration::from_secs(value),
            }),
            other => Err(format!("unknown visibility policy '{}'", other)),
        }
    }
}
