//! Sparkler engine: matchmaking, ephemeral room logs, and burn-time sessions.
//!
//! [`Sparkler`] is the service object callers hold. It is constructed once
//! and cloned into whatever needs it; nothing in this crate is global.

pub mod channel;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matchmaker;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod session;
pub mod timer;
pub mod visibility;

pub use config::EngineConfig;
pub use error::{ChannelError, MatchError, SessionError};
pub use matchmaker::MatchOutcome;
pub use service::Sparkler;
