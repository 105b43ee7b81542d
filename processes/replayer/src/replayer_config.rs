use std::time::Duration;

use config::Config;
use tracing::info;

const DEFAULT_SESSION: (&str, &str) = ("session", "session.json");
const DEFAULT_LINGER_SECS: (&str, u64) = ("linger-secs", 5);
const DEFAULT_LOOKUP_TIMEOUT_SECS: (&str, u64) = ("lookup-timeout-secs", 10);

pub struct ReplayerConfig {
    /// Recorded session to play
    pub session: String,

    /// How long to keep reporting after the last step
    pub linger: Duration,

    /// Bound on how long a `lookup` step waits for its block
    pub lookup_timeout: Duration,
}

impl ReplayerConfig {
    fn conf(config: &Config, keydef: (&str, &str)) -> String {
        let actual = config.get_string(keydef.0).unwrap_or(keydef.1.to_string());
        info!("Using '{}' for {}", actual, keydef.0);
        actual
    }

    fn secs(config: &Config, keydef: (&str, u64)) -> Duration {
        let actual = config
            .get_int(keydef.0)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(keydef.1);
        info!("Using {}s for {}", actual, keydef.0);
        Duration::from_secs(actual)
    }

    pub fn new(config: &Config) -> Self {
        Self {
            session: Self::conf(config, DEFAULT_SESSION),
            linger: Self::secs(config, DEFAULT_LINGER_SECS),
            lookup_timeout: Self::secs(config, DEFAULT_LOOKUP_TIMEOUT_SECS),
        }
    }
}
