use anyhow::Context;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Audio formats the transcoder step can produce
pub const SUPPORTED_AUDIO_FORMATS: &[&str] = &["mp3", "m4a", "opus", "ogg", "wav", "flac"];

/// Upper bound for `limit` on search requests
pub const MAX_SEARCH_LIMIT: usize = 50;

/// Which of the three services a process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Generic reverse proxy
    Proxy,
    /// Media download and transcode gateway
    Media,
    /// Thin gateway forwarding to an upstream converter
    Gateway,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Proxy => "proxy",
            ServiceKind::Media => "media",
            ServiceKind::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(ServiceKind::Proxy),
            "media" | "media-gateway" => Ok(ServiceKind::Media),
            "gateway" => Ok(ServiceKind::Gateway),
            other => anyhow::bail!("Unknown service '{}' (expected proxy, media or gateway)", other),
        }
    }
}

/// Global configuration, shared by all three services
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Thin gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Media gateway settings
    #[serde(default)]
    pub media: MediaConfig,

    /// CORS settings (thin gateway)
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, overridden by `PORT`)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Seconds to wait for servers to stop on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Listen address; `bind` is a bare IPv4 or IPv6 address (`::` or `[::]`)
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let bind = self.bind.trim();
        let host = bind
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
            .unwrap_or(bind);
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("server.bind '{}' is not an IP address", self.bind))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Upstream base URL (http only), e.g. `http://app:8000`
    pub upstream: Option<String>,

    /// Max time to wait for the upstream response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per upstream host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path answered locally instead of being forwarded
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Forward the client's Host header instead of the upstream authority
    #[serde(default)]
    pub preserve_host: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            health_path: default_health_path(),
            preserve_host: false,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Upstream converter base URL (overridden by `UPSTREAM_CONVERTER`)
    pub upstream: Option<String>,

    /// Total request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Follow upstream redirects
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            follow_redirects: true,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Root directory for finished media (overridden by `MEDIA_ROOT`)
    #[serde(default = "default_media_root")]
    pub root: PathBuf,

    /// Media extractor binary (name on PATH or path)
    #[serde(default = "default_extractor")]
    pub extractor: String,

    /// Extra arguments passed to every extractor invocation
    #[serde(default)]
    pub extractor_args: Vec<String>,

    /// Transcoder binary (name on PATH or path)
    #[serde(default = "default_transcoder")]
    pub transcoder: String,

    /// Output audio format
    #[serde(default = "default_audio_format")]
    pub audio_format: String,

    /// Output audio bitrate passed to the transcoder
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Conversions allowed to run at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Conversions allowed to wait for a slot before requests are rejected
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize,

    /// Timeout for a single extractor or transcoder run
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Default number of search results
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            extractor: default_extractor(),
            extractor_args: Vec::new(),
            transcoder: default_transcoder(),
            audio_format: default_audio_format(),
            audio_bitrate: default_audio_bitrate(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queued_jobs: default_max_queued_jobs(),
            job_timeout_secs: default_job_timeout(),
            search_limit: default_search_limit(),
        }
    }
}

impl MediaConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any origin
    #[serde(default = "default_allow_origins")]
    pub allow_origins: Vec<String>,

    /// Preflight cache lifetime in seconds
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: default_allow_origins(),
            max_age_secs: default_cors_max_age(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_true() -> bool {
    true
}

fn default_media_root() -> PathBuf {
    PathBuf::from("/data")
}

fn default_extractor() -> String {
    "yt-dlp".to_string()
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_max_queued_jobs() -> usize {
    16
}

fn default_job_timeout() -> u64 {
    600
}

fn default_search_limit() -> usize {
    10
}

fn default_allow_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_max_age() -> u64 {
    600
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the environment
    ///
    /// Empty values are treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(bind) = get("BIND") {
            self.server.bind = bind;
        }
        if let Some(upstream) = get("UPSTREAM_URL") {
            self.proxy.upstream = Some(upstream);
        }
        if let Some(upstream) = get("UPSTREAM_CONVERTER") {
            self.gateway.upstream = Some(upstream);
        }
        if let Some(root) = get("MEDIA_ROOT") {
            self.media.root = PathBuf::from(root);
        }
        if let Some(bin) = get("EXTRACTOR_BIN") {
            self.media.extractor = bin;
        }
        if let Some(bin) = get("TRANSCODER_BIN") {
            self.media.transcoder = bin;
        }
        if let Some(args) = get("EXTRACTOR_ARGS") {
            self.media.extractor_args = shell_words::split(&args)
                .map_err(|e| anyhow::anyhow!("Invalid EXTRACTOR_ARGS: {}", e))?;
        }
        if let Some(format) = get("AUDIO_FORMAT") {
            self.media.audio_format = format.to_ascii_lowercase();
        }
        if let Some(bitrate) = get("AUDIO_BITRATE") {
            self.media.audio_bitrate = bitrate;
        }
        if let Some(jobs) = get("MAX_CONCURRENT_JOBS") {
            self.media.max_concurrent_jobs = parse_env("MAX_CONCURRENT_JOBS", &jobs)?;
        }
        if let Some(origins) = get("CORS_ALLOW_ORIGINS") {
            self.cors.allow_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        Ok(())
    }

    /// Validate the settings a given service depends on
    pub fn validate_for(&self, service: ServiceKind) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.trim().is_empty() {
            errors.push("server.bind must not be empty".to_string());
        } else if let Err(e) = self.server.socket_addr() {
            errors.push(e.to_string());
        }

        match service {
            ServiceKind::Proxy => match self.proxy.upstream.as_deref() {
                None => errors.push("proxy upstream is required (set UPSTREAM_URL)".to_string()),
                Some(url) if !url.starts_with("http://") => {
                    errors.push(format!("proxy upstream '{}' must be an http:// URL", url))
                }
                Some(url) => {
                    if let Err(e) = url.parse::<hyper::Uri>() {
                        errors.push(format!("proxy upstream '{}' is invalid: {}", url, e));
                    }
                }
            },
            ServiceKind::Gateway => match self.gateway.upstream.as_deref() {
                None => errors.push(
                    "gateway upstream is required (set UPSTREAM_CONVERTER to the tunnel URL)".to_string(),
                ),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => errors
                    .push(format!("gateway upstream '{}' must be an http:// or https:// URL", url)),
                Some(_) => {}
            },
            ServiceKind::Media => {
                if self.media.extractor.trim().is_empty() {
                    errors.push("media.extractor must not be empty".to_string());
                }
                if self.media.transcoder.trim().is_empty() {
                    errors.push("media.transcoder must not be empty".to_string());
                }
                if !SUPPORTED_AUDIO_FORMATS.contains(&self.media.audio_format.as_str()) {
                    errors.push(format!(
                        "media.audio_format '{}' is not one of {}",
                        self.media.audio_format,
                        SUPPORTED_AUDIO_FORMATS.join(", ")
                    ));
                }
                if self.media.max_concurrent_jobs == 0 {
                    errors.push("media.max_concurrent_jobs must be at least 1".to_string());
                }
                if self.media.search_limit == 0 || self.media.search_limit > MAX_SEARCH_LIMIT {
                    errors.push(format!(
                        "media.search_limit must be between 1 and {}",
                        MAX_SEARCH_LIMIT
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "127.0.0.1"

[proxy]
upstream = "http://app:8000"
health_path = "/_health"

[gateway]
upstream = "https://abc.trycloudflare.com"
timeout_secs = 30

[media]
root = "/srv/media"
extractor_args = ["--cookies", "/secrets/cookies.txt"]
audio_format = "m4a"
max_concurrent_jobs = 4

[cors]
allow_origins = ["https://app.example.com"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.proxy.upstream.as_deref(), Some("http://app:8000"));
        assert_eq!(config.proxy.health_path, "/_health");
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.gateway.connect_timeout_secs, 10);
        assert_eq!(config.media.root, PathBuf::from("/srv/media"));
        assert_eq!(config.media.extractor_args.len(), 2);
        assert_eq!(config.media.audio_format, "m4a");
        assert_eq!(config.cors.allow_origins, vec!["https://app.example.com"]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.media.root, PathBuf::from("/data"));
        assert_eq!(config.media.extractor, "yt-dlp");
        assert_eq!(config.media.transcoder, "ffmpeg");
        assert_eq!(config.media.audio_format, "mp3");
        assert_eq!(config.media.max_concurrent_jobs, 2);
        assert_eq!(config.gateway.timeout(), Duration::from_secs(60));
        assert_eq!(config.gateway.connect_timeout(), Duration::from_secs(10));
        assert!(config.gateway.follow_redirects);
        assert_eq!(config.cors.allow_origins, vec!["*"]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[
                ("PORT", "10000"),
                ("MEDIA_ROOT", "/mnt/media"),
                ("UPSTREAM_CONVERTER", "https://abc.trycloudflare.com"),
                ("UPSTREAM_URL", "http://127.0.0.1:8000"),
                ("EXTRACTOR_ARGS", "--cookies '/path with space/c.txt'"),
                ("AUDIO_FORMAT", "OPUS"),
                ("MAX_CONCURRENT_JOBS", "3"),
                ("CORS_ALLOW_ORIGINS", "https://a.example, https://b.example,"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 10000);
        assert_eq!(config.media.root, PathBuf::from("/mnt/media"));
        assert_eq!(
            config.gateway.upstream.as_deref(),
            Some("https://abc.trycloudflare.com")
        );
        assert_eq!(config.proxy.upstream.as_deref(), Some("http://127.0.0.1:8000"));
        assert_eq!(
            config.media.extractor_args,
            vec!["--cookies".to_string(), "/path with space/c.txt".to_string()]
        );
        assert_eq!(config.media.audio_format, "opus");
        assert_eq!(config.media.max_concurrent_jobs, 3);
        assert_eq!(
            config.cors.allow_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_from(env(&[("PORT", ""), ("MEDIA_ROOT", "  ")])).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.media.root, PathBuf::from("/data"));
    }

    #[test]
    fn test_invalid_port_env_is_an_error() {
        let mut config = Config::default();
        let err = config.apply_env_from(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_bind_accepts_ipv4_and_ipv6() {
        let mut config = Config::default();
        config.server.port = 8080;

        config.server.bind = "0.0.0.0".to_string();
        assert_eq!(config.server.socket_addr().unwrap().to_string(), "0.0.0.0:8080");

        config.server.bind = "::".to_string();
        assert_eq!(config.server.socket_addr().unwrap().to_string(), "[::]:8080");
        assert!(config.validate_for(ServiceKind::Media).is_ok());

        config.server.bind = "[::1]".to_string();
        assert_eq!(config.server.socket_addr().unwrap().to_string(), "[::1]:8080");

        config.server.bind = "localhost".to_string();
        assert!(config.server.socket_addr().is_err());
        let err = config.validate_for(ServiceKind::Media).unwrap_err().to_string();
        assert!(err.contains("server.bind 'localhost'"), "{}", err);
    }

    #[test]
    fn test_gateway_requires_upstream() {
        let config = Config::default();
        let err = config.validate_for(ServiceKind::Gateway).unwrap_err();
        assert!(err.to_string().contains("UPSTREAM_CONVERTER"));

        let mut config = Config::default();
        config.gateway.upstream = Some("ftp://example.com".to_string());
        assert!(config.validate_for(ServiceKind::Gateway).is_err());

        config.gateway.upstream = Some("https://abc.trycloudflare.com".to_string());
        assert!(config.validate_for(ServiceKind::Gateway).is_ok());
    }

    #[test]
    fn test_proxy_requires_http_upstream() {
        let mut config = Config::default();
        assert!(config.validate_for(ServiceKind::Proxy).is_err());

        config.proxy.upstream = Some("https://app.internal".to_string());
        assert!(config.validate_for(ServiceKind::Proxy).is_err());

        config.proxy.upstream = Some("http://app.internal:8000".to_string());
        assert!(config.validate_for(ServiceKind::Proxy).is_ok());
    }

    #[test]
    fn test_media_validation_collects_all_errors() {
        let mut config = Config::default();
        config.media.audio_format = "aiff".to_string();
        config.media.max_concurrent_jobs = 0;
        config.media.search_limit = 500;

        let err = config.validate_for(ServiceKind::Media).unwrap_err().to_string();
        assert!(err.contains("audio_format"));
        assert!(err.contains("max_concurrent_jobs"));
        assert!(err.contains("search_limit"));
    }

    #[test]
    fn test_media_does_not_need_upstreams() {
        let config = Config::default();
        assert!(config.validate_for(ServiceKind::Media).is_ok());
    }

    #[test]
    fn test_service_kind_parsing() {
        assert_eq!("proxy".parse::<ServiceKind>().unwrap(), ServiceKind::Proxy);
        assert_eq!("MEDIA".parse::<ServiceKind>().unwrap(), ServiceKind::Media);
        assert_eq!("media-gateway".parse::<ServiceKind>().unwrap(), ServiceKind::Media);
        assert_eq!("gateway".parse::<ServiceKind>().unwrap(), ServiceKind::Gateway);
        assert!("worker".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 7000);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
