use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};

use sparkler_engine::EngineConfig;
use sparkler_engine::timer::TerminationPolicy;
use sparkler_engine::visibility::VisibilityPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Read `SPARKLER_*` variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: &str| -> anyhow::Result<Duration> {
            let value = var(key, default);
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", key, value))?;
            Ok(Duration::from_secs(secs))
        };

        let mut engine = EngineConfig::default();
        engine.reaper.queue_ttl = secs("SPARKLER_QUEUE_TTL_SECS", "600")?;
        engine.reaper.interval = secs("SPARKLER_REAP_INTERVAL_SECS", "600")?;
        engine.reaper.room_ttl = secs("SPARKLER_ROOM_TTL_SECS", "600")?;

        let termination = var("SPARKLER_TERMINATION", "joint");
        engine.timer.termination = TerminationPolicy::parse(&termination)
            .ok_or_else(|| anyhow!("SPARKLER_TERMINATION: unknown policy '{}'", termination))?;

        engine.visibility = var("SPARKLER_VISIBILITY", "windowed:6")
            .parse::<VisibilityPolicy>()
            .map_err(|e| anyhow!("SPARKLER_VISIBILITY: {}", e))?;

        let port = var("SPARKLER_PORT", "3000");
        Ok(Self {
            host: var("SPARKLER_HOST", "0.0.0.0"),
            port: port
                .parse()
                .with_context(|| format!("SPARKLER_PORT: bad port '{}'", port))?,
            db_path: PathBuf::from(var("SPARKLER_DB_PATH", "sparkler.db")),
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("sparkler.db"));
        assert_eq!(config.engine.reaper.queue_ttl, Duration::from_secs(600));
        assert_eq!(config.engine.timer.termination, TerminationPolicy::Joint);
        assert_eq!(
            config.engine.visibility,
            VisibilityPolicy::Windowed { count: 6 }
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("SPARKLER_PORT", "8080"),
            ("SPARKLER_QUEUE_TTL_SECS", "30"),
            ("SPARKLER_TERMINATION", "first-to-zero"),
            ("SPARKLER_VISIBILITY", "timed:6"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.engine.reaper.queue_ttl, Duration::from_secs(30));
        assert_eq!(config.engine.timer.termination, TerminationPolicy::FirstToZero);
        assert_eq!(
            config.engine.visibility,
            VisibilityPolicy::Timed {
                ttl: Duration::from_secs(6)
            }
        );
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(config(&[("SPARKLER_PORT", "http")]).is_err());
        assert!(config(&[("SPARKLER_TERMINATION", "sudden-death")]).is_err());
        assert!(config(&[("SPARKLER_REAP_INTERVAL_SECS", "-5")]).is_err());
    }
}
