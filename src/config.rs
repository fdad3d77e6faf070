//! The rewrite configuration shared read-only across all sessions, and the
//! `-p` URL parsing that builds one from the CLI.

use url::Url;

/// Immutable, shared across all sessions once parsed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteConfig {
    pub upstream_addr: String,
    pub app_name: String,
    pub play_url: String,
    pub stream_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid publish url: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("publish url has no host")]
    MissingHost,
}

impl RewriteConfig {
    /// Build a config from a `-p` argument of the shape
    /// `rtmp://host[:port]/app[?query]`, matching the source proxy's flag
    /// semantics: the path (trimmed of slashes) becomes the app name, the
    /// play/tcUrl is rebuilt from host and app name, and the stream name is
    /// `?` followed by the raw query string.
    pub fn from_publish_url(publish_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(publish_url)?;
        let host = url.host_str().ok_or(ConfigError::MissingHost)?;
        let port = url.port().unwrap_or(1935);
        let upstream_addr = format!("{host}:{port}");

        let app_name = url.path().trim_matches('/').to_string();
        let play_url = format!("rtmp://{host}/{app_name}");
        let stream_name = format!("?{}", url.query().unwrap_or(""));

        Ok(Self {
            upstream_addr,
            app_name,
            play_url,
            stream_name,
        })
    }
}
