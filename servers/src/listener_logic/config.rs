use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_relay::core::{Endpoint, OverflowPolicy};
use lib_relay::ingestors::binance_wss::{DEFAULT_MIN_TICK_SIZE, DEFAULT_UPSTREAM_URL};
use lib_relay::ingestors::forwarder::DEFAULT_DOWNSTREAM_URL;
use lib_relay::ingestors::{ForwardingSettings, IngestionSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "trade_listener.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Exchange trade listener: forwards significant price moves to the data receiver", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LISTENER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LISTENER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LISTENER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LISTENER_UPSTREAM_URL", help = "Exchange trade stream WebSocket URL.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "LISTENER_DOWNSTREAM_URL", help = "Data receiver ingress WebSocket URL.")]
    pub downstream_url: Option<String>,

    #[clap(long, env = "LISTENER_MIN_TICK_SIZE", help = "Smallest price move that is forwarded.")]
    pub min_tick_size: Option<f64>,

    #[clap(long, env = "LISTENER_RECONNECT_DELAY_MS", help = "Fixed delay in milliseconds between reconnect attempts.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "LISTENER_CONNECT_TIMEOUT_MS", help = "Timeout in milliseconds for connect and handshake.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "LISTENER_HANDOFF_CAPACITY", help = "Maximum queued moves between ingestion and forwarding (unbounded when unset).")]
    pub handoff_capacity: Option<usize>,

    #[clap(long, env = "LISTENER_OVERFLOW_POLICY", help = "What a full handoff queue gives up: drop-oldest or reject-newest.")]
    pub overflow_policy: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            upstream_url: other.upstream_url.or(self.upstream_url),
            downstream_url: other.downstream_url.or(self.downstream_url),
            min_tick_size: other.min_tick_size.or(self.min_tick_size),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            handoff_capacity: other.handoff_capacity.or(self.handoff_capacity),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            upstream_url: Some(DEFAULT_UPSTREAM_URL.to_string()),
            downstream_url: Some(DEFAULT_DOWNSTREAM_URL.to_string()),
            min_tick_size: Some(DEFAULT_MIN_TICK_SIZE),
            reconnect_delay_ms: Some(3000),
            connect_timeout_ms: Some(10_000),
            overflow_policy: Some("drop-oldest".to_string()),
            ..Default::default()
        }
    }
}

/// Validated listener settings.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub ingestion: IngestionSettings,
    pub forwarding: ForwardingSettings,
    pub connect_timeout: Duration,
    pub handoff_capacity: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub log_dir: PathBuf,
    pub log_level: String,
}

/// Defaults, then the JSON config file, then environment and CLI.
pub fn load_config() -> Result<Config> {
    load_config_with(Config::parse())
}

pub fn load_config_with(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path)? {
        current_config = current_config.merge(file_config);
    }

    Ok(current_config.merge(cli))
}

fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(Some(file_config))
}

impl Config {
    pub fn resolve(self) -> Result<ListenerSettings> {
        let defaults = Config::defaults();
        let config = defaults.merge(self);

        let upstream_url = config.upstream_url.unwrap_or_default();
        let downstream_url = config.downstream_url.unwrap_or_default();
        let upstream = Endpoint::parse(&upstream_url).context("upstreamUrl")?;
        let downstream = Endpoint::parse(&downstream_url).context("downstreamUrl")?;

        let min_tick_size = config.min_tick_size.unwrap_or(DEFAULT_MIN_TICK_SIZE);
        if !(min_tick_size.is_finite() && min_tick_size > 0.0) {
            bail!("minTickSize must be a positive number, got {}", min_tick_size);
        }

        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms.unwrap_or(3000));
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms.unwrap_or(10_000));
        if connect_timeout.is_zero() {
            bail!("connectTimeoutMs must be positive");
        }

        if config.handoff_capacity == Some(0) {
            bail!("handoffCapacity must be positive when set");
        }
        let overflow_policy = match config.overflow_policy.as_deref() {
            Some(raw) => raw.parse::<OverflowPolicy>().map_err(anyhow::Error::msg)?,
            None => OverflowPolicy::default(),
        };

        let mut ingestion = IngestionSettings::new(upstream);
        ingestion.min_tick_size = min_tick_size;
        ingestion.reconnect_delay = reconnect_delay;

        let mut forwarding = ForwardingSettings::new(downstream);
        forwarding.reconnect_delay = reconnect_delay;

        Ok(ListenerSettings {
            ingestion,
            forwarding,
            connect_timeout,
            handoff_capacity: config.handoff_capacity,
            overflow_policy,
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_file() -> Config {
        Config {
            config_path: Some(PathBuf::from("/nonexistent/trade_listener.conf")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_point_at_the_exchange_and_local_receiver() {
        let settings = load_config_with(missing_file()).unwrap().resolve().unwrap();
        assert_eq!(settings.ingestion.upstream.host, "fstream.binance.com");
        assert_eq!(settings.ingestion.upstream.path, "/ws/btcusdt@trade");
        assert!(settings.ingestion.upstream.secure);
        assert_eq!(settings.forwarding.downstream.port, 8082);
        assert_eq!(settings.forwarding.downstream.path, "/internal");
        assert_eq!(settings.ingestion.min_tick_size, 0.2);
        assert_eq!(settings.ingestion.reconnect_delay, Duration::from_millis(3000));
        assert_eq!(settings.handoff_capacity, None);
        assert_eq!(settings.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn file_values_are_overridden_by_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listener.conf");
        fs::write(
            &path,
            r#"{"minTickSize":0.5,"reconnectDelayMs":250,"downstreamUrl":"ws://10.0.0.2:9000/in"}"#,
        )
        .unwrap();

        let cli = Config {
            config_path: Some(path),
            reconnect_delay_ms: Some(100),
            ..Default::default()
        };
        let settings = load_config_with(cli).unwrap().resolve().unwrap();
        assert_eq!(settings.ingestion.min_tick_size, 0.5);
        assert_eq!(settings.forwarding.reconnect_delay, Duration::from_millis(100));
        assert_eq!(settings.forwarding.downstream.host, "10.0.0.2");
        assert_eq!(settings.forwarding.downstream.port, 9000);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "{ not json").unwrap();
        let cli = Config {
            config_path: Some(path),
            ..Default::default()
        };
        assert!(load_config_with(cli).is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        for bad in [
            Config { min_tick_size: Some(0.0), ..Default::default() },
            Config { min_tick_size: Some(-1.0), ..Default::default() },
            Config { handoff_capacity: Some(0), ..Default::default() },
            Config { overflow_policy: Some("block".into()), ..Default::default() },
            Config { upstream_url: Some("http://example.com".into()), ..Default::default() },
        ] {
            assert!(bad.resolve().is_err());
        }
    }
}
