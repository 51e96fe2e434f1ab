use std::fmt;

use url::Url;

use crate::core::error::RelayError;

/// Where a stream client connects: `host:port/path`, plaintext or TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Request path including any query string, always starting with `/`.
    pub path: String,
    /// `wss://` when true.
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>, secure: bool) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            host: host.into(),
            port,
            path,
            secure,
        }
    }

    /// Parses a `ws://` or `wss://` URL. The port falls back to 80/443.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let invalid = |reason: String| RelayError::InvalidEndpoint {
            url: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port".to_string()))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self::new(host, port, path, secure))
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}
