use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::channel_map::{catalog, ChannelMap, ChannelMapConfig, MAX_CHANNELS, MAX_UNIVERSE};
use crate::fusion::coordinator::FusionSettings;
use crate::fusion::snapshot::StalenessPolicy;
use crate::net::decoder::DecoderSettings;
use crate::net::sacn;
use crate::query::poller::PollerSettings;

pub use crate::channel_map::ConfigError;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Game server host for the query API
    pub ee_host: String,
    /// Game server HTTP port
    pub ee_http_port: u16,
    pub poll_interval: Duration,
    /// Bound on each individual query
    pub query_timeout: Duration,
    /// Address the broadcast socket binds to
    pub sacn_bind_address: IpAddr,
    pub sacn_port: u16,
    pub sacn_universe: u16,
    pub sacn_channels: u16,
    /// Resend interval the game server was configured with
    pub sacn_resend_delay: Duration,
    /// Selected broadcast variables, in any order
    pub sacn_variables: Vec<String>,
    pub sacn_join_multicast: bool,
    pub metrics_port: u16,
    pub broadcast_stale: Duration,
    /// Defaults to three poll intervals
    pub query_stale: Option<Duration>,
    /// Defaults to two poll intervals
    pub activation_grace: Option<Duration>,
    pub primary_buffer_grace: Duration,
    pub retired_retention: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ee_host: "127.0.0.1".to_string(),
            ee_http_port: 8080,
            poll_interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            sacn_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sacn_port: sacn::ACN_SDT_MULTICAST_PORT,
            sacn_universe: 2,
            sacn_channels: 50,
            sacn_resend_delay: Duration::from_millis(50),
            sacn_variables: catalog::DEFAULT_SELECTION.iter().map(|s| s.to_string()).collect(),
            sacn_join_multicast: true,
            metrics_port: 9090,
            broadcast_stale: Duration::from_secs(2),
            query_stale: None,
            activation_grace: None,
            primary_buffer_grace: Duration::from_secs(5),
            retired_retention: Duration::from_secs(60),
        }
    }
}

/// Read `name`, parse it and check it; warn and return `None` otherwise
fn parse_var<T, F>(lookup: &F, name: &str, valid: impl Fn(&T) -> bool, rule: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn parse_secs<F>(lookup: &F, name: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_var::<f64, F>(lookup, name, |v| v.is_finite() && *v > 0.0, "a positive number of seconds")?;
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => Some(duration),
        Err(_) => {
            tracing::warn!("{} is out of range, using default", name);
            None
        }
    }
}

impl BridgeConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    /// Load config through `lookup` (an environment stand-in)
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("EE_HOST") {
            let host = host.trim();
            if host.is_empty() {
                tracing::warn!("EE_HOST is empty, using default");
            } else {
                config.ee_host = host.to_string();
            }
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "EE_HTTP_PORT", |p| *p > 0, "> 0") {
            config.ee_http_port = port;
        }
        if let Some(interval) = parse_secs(&lookup, "POLL_INTERVAL_SECS") {
            config.poll_interval = interval;
        }
        if let Some(timeout) = parse_secs(&lookup, "QUERY_TIMEOUT_SECS") {
            config.query_timeout = timeout;
        }

        if let Some(addr) = parse_var::<IpAddr, _>(&lookup, "SACN_BIND_ADDRESS", |_| true, "an IP address") {
            config.sacn_bind_address = addr;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "SACN_PORT", |p| *p > 0, "> 0") {
            config.sacn_port = port;
        }
        if let Some(universe) = parse_var::<u16, _>(
            &lookup,
            "SACN_UNIVERSE",
            |u| (1..=MAX_UNIVERSE).contains(u),
            "1-63999",
        ) {
            config.sacn_universe = universe;
        }
        if let Some(channels) = parse_var::<u16, _>(
            &lookup,
            "SACN_CHANNELS",
            |c| (1..=MAX_CHANNELS).contains(c),
            "1-512",
        ) {
            config.sacn_channels = channels;
        }
        if let Some(delay) = parse_var::<u64, _>(
            &lookup,
            "SACN_RESEND_DELAY_MS",
            |d| (1..=60_000).contains(d),
            "1-60000",
        ) {
            config.sacn_resend_delay = Duration::from_millis(delay);
        }
        if let Some(list) = lookup("SACN_VARIABLES") {
            let variables: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            if variables.is_empty() {
                tracing::warn!("SACN_VARIABLES is empty, using the standard selection");
            } else {
                config.sacn_variables = variables;
            }
        }
        if let Some(join) = parse_var::<bool, _>(&lookup, "SACN_JOIN_MULTICAST", |_| true, "true or false") {
            config.sacn_join_multicast = join;
        }

        if let Some(port) = parse_var::<u16, _>(&lookup, "METRICS_PORT", |p| *p > 0, "> 0") {
            config.metrics_port = port;
        }

        if let Some(stale) = parse_secs(&lookup, "BROADCAST_STALE_SECS") {
            config.broadcast_stale = stale;
        }
        config.query_stale = parse_secs(&lookup, "QUERY_STALE_SECS");
        config.activation_grace = parse_secs(&lookup, "ACTIVATION_GRACE_SECS");
        if let Some(grace) = parse_secs(&lookup, "PRIMARY_BUFFER_GRACE_SECS") {
            config.primary_buffer_grace = grace;
        }
        if let Some(retention) = parse_secs(&lookup, "RETIRED_RETENTION_SECS") {
            config.retired_retention = retention;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ee_host.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "EE_HOST",
                reason: "cannot be empty".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "POLL_INTERVAL_SECS",
                reason: "must be > 0".to_string(),
            });
        }
        if self.poll_interval.checked_mul(3).is_none() {
            return Err(ConfigError::InvalidSetting {
                name: "POLL_INTERVAL_SECS",
                reason: "is out of range".to_string(),
            });
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "QUERY_TIMEOUT_SECS",
                reason: "must be > 0".to_string(),
            });
        }
        if self.query_stale() < self.poll_interval {
            return Err(ConfigError::InvalidSetting {
                name: "QUERY_STALE_SECS",
                reason: format!("must be at least the poll interval ({:?})", self.poll_interval),
            });
        }
        if self.broadcast_stale < self.sacn_resend_delay {
            return Err(ConfigError::InvalidSetting {
                name: "BROADCAST_STALE_SECS",
                reason: format!("must be at least the resend delay ({:?})", self.sacn_resend_delay),
            });
        }
        if self.query_timeout > self.poll_interval {
            tracing::warn!(
                "QUERY_TIMEOUT_SECS ({:?}) exceeds POLL_INTERVAL_SECS ({:?}); cycles may overrun",
                self.query_timeout,
                self.poll_interval
            );
        }

        self.channel_map().map(|_| ())
    }

    /// Base URL of the query API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ee_host, self.ee_http_port)
    }

    /// Saturates instead of overflowing; `validate` rejects such intervals
    pub fn query_stale(&self) -> Duration {
        self.query_stale
            .unwrap_or_else(|| self.poll_interval.checked_mul(3).unwrap_or(Duration::MAX))
    }

    pub fn activation_grace(&self) -> Duration {
        self.activation_grace
            .unwrap_or_else(|| self.poll_interval.checked_mul(2).unwrap_or(Duration::MAX))
    }

    pub fn channel_map_config(&self) -> ChannelMapConfig {
        ChannelMapConfig {
            universe: self.sacn_universe,
            channel_count: self.sacn_channels,
            resend_delay: self.sacn_resend_delay,
            variables: self.sacn_variables.clone(),
        }
    }

    /// Generate the channel map; fails on any configuration error
    pub fn channel_map(&self) -> Result<ChannelMap, ConfigError> {
        ChannelMap::generate(&self.channel_map_config())
    }

    pub fn fusion_settings(&self) -> FusionSettings {
        FusionSettings {
            staleness: StalenessPolicy {
                broadcast: self.broadcast_stale,
                query: self.query_stale(),
            },
            activation_grace: self.activation_grace(),
            primary_buffer_grace: self.primary_buffer_grace,
            retired_retention: self.retired_retention,
            ..FusionSettings::default()
        }
    }

    pub fn decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            bind_addr: SocketAddr::new(self.sacn_bind_address, self.sacn_port),
            universe: self.sacn_universe,
            resend_interval: self.sacn_resend_delay,
            join_multicast: self.sacn_join_multicast,
            ..DecoderSettings::default()
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> BridgeConfig {
        let env: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        BridgeConfig::load_from(move |name| env.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.ee_http_port, 8080);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.sacn_port, 5568);
        assert_eq!(config.sacn_universe, 2);
        assert_eq!(config.sacn_channels, 50);
        assert_eq!(config.sacn_variables.len(), 12);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_timings_follow_poll_interval() {
        let config = load(&[("POLL_INTERVAL_SECS", "4")]);
        assert_eq!(config.query_stale(), Duration::from_secs(12));
        assert_eq!(config.activation_grace(), Duration::from_secs(8));

        let fusion = config.fusion_settings();
        assert_eq!(fusion.staleness.query, Duration::from_secs(12));
        assert_eq!(fusion.staleness.broadcast, Duration::from_secs(2));
        assert_eq!(fusion.activation_grace, Duration::from_secs(8));

        let explicit = load(&[("POLL_INTERVAL_SECS", "4"), ("QUERY_STALE_SECS", "20")]);
        assert_eq!(explicit.query_stale(), Duration::from_secs(20));
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("EE_HOST", "bridge.local"),
            ("EE_HTTP_PORT", "8081"),
            ("SACN_UNIVERSE", "7"),
            ("SACN_BIND_ADDRESS", "127.0.0.1"),
            ("SACN_PORT", "6000"),
            ("SACN_VARIABLES", "hull, energy ,warp"),
            ("SACN_JOIN_MULTICAST", "false"),
            ("SACN_RESEND_DELAY_MS", "100"),
        ]);
        assert_eq!(config.base_url(), "http://bridge.local:8081");
        assert_eq!(config.sacn_variables, vec!["hull", "energy", "warp"]);

        let decoder = config.decoder_settings();
        assert_eq!(decoder.bind_addr, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
        assert_eq!(decoder.universe, 7);
        assert!(!decoder.join_multicast);
        assert_eq!(decoder.liveness_timeout(), Duration::from_millis(300));

        let map = config.channel_map().unwrap();
        assert_eq!(map.universe(), 7);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("EE_HTTP_PORT", "0"),
            ("SACN_UNIVERSE", "70000"),
            ("SACN_CHANNELS", "600"),
            ("POLL_INTERVAL_SECS", "soon"),
            ("SACN_VARIABLES", " , "),
            ("SACN_RESEND_DELAY_MS", "18446744073709551615"),
        ]);
        let defaults = BridgeConfig::default();
        assert_eq!(config.ee_http_port, defaults.ee_http_port);
        assert_eq!(config.sacn_universe, defaults.sacn_universe);
        assert_eq!(config.sacn_channels, defaults.sacn_channels);
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.sacn_variables, defaults.sacn_variables);
        assert_eq!(config.sacn_resend_delay, defaults.sacn_resend_delay);
    }

    #[test]
    fn test_validate_rejects_channel_overflow() {
        let config = load(&[("SACN_CHANNELS", "4")]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ChannelOverflow {
                selected: 12,
                available: 4
            })
        );
    }

    #[test]
    fn test_validate_rejects_unknown_variable() {
        let config = load(&[("SACN_VARIABLES", "hull,warpCore")]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownVariable("warpCore".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_short_query_staleness() {
        let config = load(&[("POLL_INTERVAL_SECS", "10"), ("QUERY_STALE_SECS", "5")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting {
                name: "QUERY_STALE_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_huge_seconds_fall_back() {
        let config = load(&[
            ("POLL_INTERVAL_SECS", "1e30"),
            ("QUERY_TIMEOUT_SECS", "1e300"),
            ("RETIRED_RETENTION_SECS", "inf"),
        ]);
        let defaults = BridgeConfig::default();
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.query_timeout, defaults.query_timeout);
        assert_eq!(config.retired_retention, defaults.retired_retention);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_interval_that_overflows() {
        let config = load(&[("POLL_INTERVAL_SECS", "1e19")]);
        assert_eq!(config.query_stale(), Duration::MAX);
        assert_eq!(config.activation_grace(), Duration::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting {
                name: "POLL_INTERVAL_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_load_or_default() {
        let config = BridgeConfig::load_or_default();
        assert!(config.ee_http_port > 0);
    }
}
