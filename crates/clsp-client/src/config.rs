//! C1 — StreamConfiguration, plus the ambient-stack global/surface config
//! structs (spec.md §6 "Configuration").

use std::time::Duration;

use url::Url;

use crate::error::ClspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Clsp,
    Clsps,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "clsp" => Some(Self::Clsp),
            "clsps" => Some(Self::Clsps),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Clsp => "clsp",
            Self::Clsps => "clsps",
        }
    }

    fn implies_tls(self) -> bool {
        matches!(self, Self::Clsps)
    }
}

/// An immutable, validated streaming target. Two configurations compare
/// equal iff every field is equal (derived `PartialEq`, field-wise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfiguration {
    scheme: Scheme,
    host: String,
    port: u16,
    stream_name: String,
    use_ssl: bool,
    token: Option<String>,
}

impl StreamConfiguration {
    /// Constructs from already-validated fields, rejecting an empty host or
    /// stream name the same way `from_url` would.
    pub fn validated(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        stream_name: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ClspError> {
        let host = host.into();
        let stream_name = stream_name.into();
        if host.is_empty() {
            return Err(ClspError::InvalidUrl("empty host".to_owned()));
        }
        if stream_name.is_empty() {
            return Err(ClspError::InvalidUrl("empty stream name".to_owned()));
        }
        let use_ssl = scheme.implies_tls();
        Ok(Self {
            scheme,
            host,
            port,
            stream_name,
            use_ssl,
            token,
        })
    }

    pub fn from_url(raw: &str) -> Result<Self, ClspError> {
        let url = Url::parse(raw).map_err(|e| ClspError::InvalidUrl(e.to_string()))?;

        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| ClspError::InvalidUrl(format!("unrecognized scheme `{}`", url.scheme())))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClspError::InvalidUrl("missing host".to_owned()))?
            .to_owned();

        let port = url.port().unwrap_or(if scheme.implies_tls() { 443 } else { 80 });

        let stream_name = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ClspError::InvalidUrl("missing stream name".to_owned()))?
            .to_owned();

        let token = url.query_pairs().find(|(k, _)| k == "token").map(|(_, v)| v.into_owned());

        Self::validated(scheme, host, port, stream_name, token)
    }

    /// Canonical inverse of `from_url`, used by round-trip tests (spec.md L4).
    pub fn to_url(&self) -> String {
        let mut url = format!("{}://{}:{}/{}", self.scheme.as_str(), self.host, self.port, self.stream_name);
        if let Some(token) = &self.token {
            url.push_str("?token=");
            url.push_str(token);
        }
        url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `ws://` or `wss://` endpoint the MQTT conduit connects its websocket
    /// transport to.
    pub fn websocket_url(&self) -> String {
        let ws_scheme = if self.use_ssl { "wss" } else { "ws" };
        format!("{ws_scheme}://{}:{}/mqtt", self.host, self.port)
    }
}

/// Recognized global options (spec.md §6 "Configuration").
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub enable_metrics: bool,
    pub connection_change_play_delay: Duration,
    pub show_next_video_delay: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            connection_change_play_delay: Duration::from_secs(5),
            show_next_video_delay: Duration::from_millis(500),
        }
    }
}

/// On-the-wire shape for [`GlobalConfig`]: durations as plain millisecond
/// counts, the way `devolutions-gateway`'s own config DTOs store durations as
/// `Option<u64>` seconds and convert by hand rather than deriving through a
/// `Duration` directly (spec.md §6 "Configuration").
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GlobalConfigDto {
    pub enable_metrics: bool,
    pub connection_change_play_delay_ms: u64,
    pub show_next_video_delay_ms: u64,
}

impl Default for GlobalConfigDto {
    fn default() -> Self {
        let defaults = GlobalConfig::default();
        Self {
            enable_metrics: defaults.enable_metrics,
            connection_change_play_delay_ms: defaults.connection_change_play_delay.as_millis() as u64,
            show_next_video_delay_ms: defaults.show_next_video_delay.as_millis() as u64,
        }
    }
}

impl From<GlobalConfigDto> for GlobalConfig {
    fn from(dto: GlobalConfigDto) -> Self {
        Self {
            enable_metrics: dto.enable_metrics,
            connection_change_play_delay: Duration::from_millis(dto.connection_change_play_delay_ms),
            show_next_video_delay: Duration::from_millis(dto.show_next_video_delay_ms),
        }
    }
}
