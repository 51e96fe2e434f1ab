use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_relay::hub::{DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_TOPIC, HubSettings, SlowSubscriberPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "data_receiver.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Data receiver: fans forwarded trade moves out to public subscribers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RECEIVER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RECEIVER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RECEIVER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RECEIVER_BIND_IP", help = "Address both surfaces listen on.")]
    pub bind_ip: Option<IpAddr>,

    #[clap(long, env = "RECEIVER_PUBLIC_PORT", help = "Port of the public subscriber surface.")]
    pub public_port: Option<u16>,

    #[clap(long, env = "RECEIVER_PUBLIC_PATH", help = "WebSocket path of the public surface.")]
    pub public_path: Option<String>,

    #[clap(long, env = "RECEIVER_INTERNAL_PORT", help = "Port of the ingress surface.")]
    pub internal_port: Option<u16>,

    #[clap(long, env = "RECEIVER_INTERNAL_PATH", help = "WebSocket path of the ingress surface.")]
    pub internal_path: Option<String>,

    #[clap(long, env = "RECEIVER_TOPIC", help = "Topic forwarded moves are published on.")]
    pub topic: Option<String>,

    #[clap(long, env = "RECEIVER_IDLE_TIMEOUT_SECONDS", help = "Seconds a subscriber may stay silent before it is closed.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "RECEIVER_PUBLIC_MAX_PAYLOAD", help = "Largest frame in bytes accepted on the public surface.")]
    pub public_max_payload: Option<usize>,

    #[clap(long, env = "RECEIVER_INTERNAL_MAX_PAYLOAD", help = "Largest frame in bytes accepted on the ingress surface.")]
    pub internal_max_payload: Option<usize>,

    #[clap(long, env = "RECEIVER_SUBSCRIBER_BUFFER", help = "Frames queued per subscriber before the slow subscriber policy applies.")]
    pub subscriber_buffer: Option<usize>,

    #[clap(long, env = "RECEIVER_SLOW_SUBSCRIBER_POLICY", help = "drop or disconnect.")]
    pub slow_subscriber_policy: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            bind_ip: other.bind_ip.or(self.bind_ip),
            public_port: other.public_port.or(self.public_port),
            public_path: other.public_path.or(self.public_path),
            internal_port: other.internal_port.or(self.internal_port),
            internal_path: other.internal_path.or(self.internal_path),
            topic: other.topic.or(self.topic),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            public_max_payload: other.public_max_payload.or(self.public_max_payload),
            internal_max_payload: other.internal_max_payload.or(self.internal_max_payload),
            subscriber_buffer: other.subscriber_buffer.or(self.subscriber_buffer),
            slow_subscriber_policy: other.slow_subscriber_policy.or(self.slow_subscriber_policy),
        }
    }

    fn defaults() -> Config {
        let hub = HubSettings::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            bind_ip: Some(hub.bind_ip),
            public_port: Some(hub.public_port),
            public_path: Some(hub.public_path),
            internal_port: Some(hub.ingress_port),
            internal_path: Some(hub.ingress_path),
            topic: Some(DEFAULT_TOPIC.to_string()),
            idle_timeout_seconds: Some(hub.idle_timeout.as_secs()),
            public_max_payload: Some(hub.public_max_payload),
            internal_max_payload: Some(hub.ingress_max_payload),
            subscriber_buffer: Some(DEFAULT_SUBSCRIBER_BUFFER),
            slow_subscriber_policy: Some("drop".to_string()),
            ..Default::default()
        }
    }
}

/// Validated receiver settings.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub hub: HubSettings,
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
    pub fn resolve(self) -> Result<ReceiverSettings> {
        let config = Config::defaults().merge(self);
        let mut hub = HubSettings::default();

        if let Some(ip) = config.bind_ip {
            hub.bind_ip = ip;
        }
        if let Some(port) = config.public_port {
            hub.public_port = port;
        }
        if let Some(path) = config.public_path {
            hub.public_path = path;
        }
        if let Some(port) = config.internal_port {
            hub.ingress_port = port;
        }
        if let Some(path) = config.internal_path {
            hub.ingress_path = path;
        }
        if let Some(topic) = config.topic {
            hub.topic = topic;
        }
        if let Some(secs) = config.idle_timeout_seconds {
            if secs == 0 {
                bail!("idleTimeoutSeconds must be positive");
            }
            hub.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(cap) = config.public_max_payload {
            hub.public_max_payload = cap;
        }
        if let Some(cap) = config.internal_max_payload {
            hub.ingress_max_payload = cap;
        }
        if let Some(buffer) = config.subscriber_buffer {
            hub.subscriber_buffer = buffer;
        }
        if let Some(policy) = config.slow_subscriber_policy.as_deref() {
            hub.slow_subscriber_policy = policy
                .parse::<SlowSubscriberPolicy>()
                .map_err(anyhow::Error::msg)?;
        }
        if hub.public_port == hub.ingress_port && hub.public_port != 0 {
            bail!("publicPort and internalPort must differ ({})", hub.public_port);
        }
        hub.validate()?;

        Ok(ReceiverSettings {
            hub,
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}
