use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolverConfig {
    pub rpc_poll_interval_ms: u64,
    #[serde(default)]
    pub rpc_max_attempts: Option<u32>,
    /// Cap for resolutions nobody is waiting on, such as finalized blocks
    /// that were never announced
    pub background_max_attempts: u32,
}

impl ResolverConfig {
    pub fn rpc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rpc_poll_interval_ms)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventsConfig {
    pub max_group_length: usize,
    pub max_block_length: usize,
    pub max_length: usize,
    pub deny: Vec<String>,
    pub allow: Vec<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrackerConfig {
    pub max_retention_secs: u64,
    pub change_buffer: usize,
    pub resolver: ResolverConfig,
    pub events: EventsConfig,
}

impl TrackerConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let cfg = TrackerConfig::try_load(&Config::builder().build().unwrap()).unwrap();
        assert_eq!(cfg.max_retention(), Duration::from_secs(3600));
        assert_eq!(cfg.resolver.rpc_poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.resolver.rpc_max_attempts, None);
        assert_eq!(cfg.resolver.background_max_attempts, 30);
        assert_eq!(cfg.events.max_group_length, 7);
        assert_eq!(cfg.events.max_block_length, 5);
        assert_eq!(cfg.events.max_length, 600);
        assert!(cfg.events.deny.contains(&"System.*".to_string()));
        assert_eq!(cfg.events.allow, vec!["System.Remarked".to_string()]);
    }

    #[test]
    fn overrides_win() {
        let overrides = Config::builder()
            .set_override("max-retention-secs", 5)
            .unwrap()
            .set_override("resolver.rpc-max-attempts", 3)
            .unwrap()
            .build()
            .unwrap();
        let cfg = TrackerConfig::try_load(&overrides).unwrap();
        assert_eq!(cfg.max_retention_secs, 5);
        assert_eq!(cfg.resolver.rpc_max_attempts, Some(3));
        assert_eq!(cfg.resolver.rpc_poll_interval_ms, 1000);
    }
}
