//! Configuration loading and resolution.
//!
//! Every knob has a default; [`ServiceConfig::from_env`] overlays `MIRAGE_*`
//! environment variables and the binary overlays its CLI flags on top.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Desktop user agent presented by sessions and media fetches.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Public origin used to build media reference URLs.
    pub base_url: String,
    pub pool: PoolConfig,
    pub race: RaceConfig,
    pub browser: BrowserConfig,
    pub media: MediaConfig,
    pub tiktok: TikTokConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1337,
            base_url: "http://127.0.0.1:1337".to_string(),
            pool: PoolConfig::default(),
            race: RaceConfig::default(),
            browser: BrowserConfig::default(),
            media: MediaConfig::default(),
            tiktok: TikTokConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults overlaid with `MIRAGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("MIRAGE_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("MIRAGE_PORT") {
            config.port = port;
        }
        if let Ok(base_url) = std::env::var("MIRAGE_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(size) = env_parse::<usize>("MIRAGE_POOL_SIZE") {
            config.pool.capacity = size;
        }
        if let Some(size) = env_parse::<usize>("MIRAGE_RESERVED_POOL_SIZE") {
            config.pool.reserved_capacity = size;
        }
        if let Ok(endpoint) = std::env::var("MIRAGE_BROWSER_WS") {
            let options = std::env::var("MIRAGE_BROWSER_OPTIONS")
                .map(|raw| parse_browser_options(&raw))
                .unwrap_or_default();
            config.browser.target = ConnectionTarget::Remote { endpoint, options };
        } else if let Ok(path) = std::env::var("MIRAGE_CHROMIUM_PATH") {
            config.browser.target = ConnectionTarget::Local {
                executable: Some(PathBuf::from(path)),
                headless: true,
            };
        }
        if let Ok(path) = std::env::var("MIRAGE_COOKIES") {
            config.browser.cookies_path = Some(PathBuf::from(path));
        }
        if let Ok(origin) = std::env::var("MIRAGE_TIKTOK_ORIGIN") {
            config.tiktok.origin = origin.trim_end_matches('/').to_string();
        }

        config
    }

    /// Socket address string for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse one `key=value` remote browser option.
pub fn parse_browser_option(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Comma-separated `key=value` pairs; malformed entries are skipped.
pub fn parse_browser_options(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let option = parse_browser_option(entry);
            if option.is_none() {
                tracing::warn!("ignoring malformed browser option {entry:?}");
            }
            option
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw}");
            None
        }
    }
}

/// Session pool sizing and admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// General-purpose sessions.
    pub capacity: usize,
    /// Extra sessions dedicated to reserved (slow) checkouts.
    /// Zero means reserved checkouts share the general lane.
    pub reserved_capacity: usize,
    /// How often a waiting checkout re-checks the idle set.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Waiters allowed per lane before checkouts are rejected.
    pub max_waiters: usize,
    /// Navigate released sessions to a blank page before reuse.
    pub health_probe: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 6,
            reserved_capacity: 0,
            poll_interval: Duration::from_secs(1),
            max_waiters: 64,
            health_probe: true,
        }
    }
}

/// Race timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Deadline for lookups with a single signal source.
    #[serde(with = "duration_ms")]
    pub narrow_deadline: Duration,
    /// Deadline for lookups racing several signal sources.
    #[serde(with = "duration_ms")]
    pub broad_deadline: Duration,
    /// Delay before the rendered document is inspected.
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    /// Resource locks kept before idle ones are pruned.
    pub max_locks: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            narrow_deadline: Duration::from_secs(6),
            broad_deadline: Duration::from_secs(12),
            settle_delay: Duration::from_millis(500),
            max_locks: 4096,
        }
    }
}

/// Where the browser lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionTarget {
    /// A remote CDP websocket; `options` are appended as query parameters.
    Remote {
        endpoint: String,
        options: Vec<(String, String)>,
    },
    /// A locally launched Chromium.
    Local {
        executable: Option<PathBuf>,
        headless: bool,
    },
}

impl ConnectionTarget {
    /// Websocket URL with the options query-encoded.
    pub fn ws_url(&self) -> Option<String> {
        match self {
            ConnectionTarget::Remote { endpoint, options } => {
                let mut url = url::Url::parse(endpoint).ok()?;
                if !options.is_empty() {
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in options {
                        pairs.append_pair(key, value);
                    }
                }
                Some(url.to_string())
            }
            ConnectionTarget::Local { .. } => None,
        }
    }
}

/// Browser session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub target: ConnectionTarget,
    pub user_agent: String,
    pub locale: String,
    /// Cookie jar (Netscape or JSON array) applied before any session is used.
    pub cookies_path: Option<PathBuf>,
    /// Run when the browser executable is missing.
    pub install_command: Vec<String>,
    /// Run when the host lacks shared libraries.
    pub install_deps_command: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            target: ConnectionTarget::Local {
                executable: None,
                headless: true,
            },
            user_agent: DEFAULT_USER_AGENT.to_string(),
            locale: "en-US".to_string(),
            cookies_path: None,
            install_command: vec![
                "npx".to_string(),
                "playwright".to_string(),
                "install".to_string(),
                "chromium".to_string(),
            ],
            install_deps_command: vec![
                "npx".to_string(),
                "playwright".to_string(),
                "install-deps".to_string(),
                "chromium".to_string(),
            ],
        }
    }
}

/// Media redistribution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Registrations kept before the least recently used are evicted.
    pub max_entries: usize,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

/// TikTok upstream settings. TikTok lookups use plain HTTP, not sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TikTokConfig {
    /// Origin serving profile pages and the item APIs.
    pub origin: String,
    /// Player API attempts before a post is reported unresolved.
    pub attempts: usize,
    #[serde(with = "duration_ms")]
    pub retry_wait: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for TikTokConfig {
    fn default() -> Self {
        Self {
            origin: "https://www.tiktok.com".to_string(),
            attempts: 3,
            retry_wait: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_source_behaviour() {
        let config = ServiceConfig::default();
        assert_eq!(config.pool.capacity, 6);
        assert_eq!(config.pool.reserved_capacity, 0);
        assert_eq!(config.race.narrow_deadline, Duration::from_secs(6));
        assert_eq!(config.race.broad_deadline, Duration::from_secs(12));
        assert_eq!(config.bind_addr(), "0.0.0.0:1337");
    }

    #[test]
    fn test_remote_ws_url_encodes_options() {
        let target = ConnectionTarget::Remote {
            endpoint: "ws://127.0.0.1:48324/".to_string(),
            options: vec![
                ("stealth".to_string(), "true".to_string()),
                ("--proxy-server".to_string(), "socks5://warp:40000".to_string()),
            ],
        };
        let url = target.ws_url().unwrap();
        assert!(url.starts_with("ws://127.0.0.1:48324/?"));
        assert!(url.contains("stealth=true"));
        assert!(url.contains("socks5%3A%2F%2Fwarp%3A40000"));
    }

    #[test]
    fn test_parse_browser_options() {
        assert_eq!(
            parse_browser_options("token=abc, stealth=true,--proxy-server=socks5://warp:40000,junk"),
            vec![
                ("token".to_string(), "abc".to_string()),
                ("stealth".to_string(), "true".to_string()),
                ("--proxy-server".to_string(), "socks5://warp:40000".to_string()),
            ]
        );
        assert_eq!(parse_browser_option("=x"), None);
        assert_eq!(
            parse_browser_option("blockAds=").as_ref().map(|(k, v)| (k.as_str(), v.as_str())),
            Some(("blockAds", ""))
        );
    }

    #[test]
    fn test_local_target_has_no_ws_url() {
        assert!(BrowserConfig::default().target.ws_url().is_none());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"port": 8080, "pool": {"capacity": 2}}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.pool.poll_interval, Duration::from_secs(1));
        assert_eq!(config.tiktok.attempts, 3);
    }

    #[test]
    fn test_tiktok_section_overrides() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"tiktok": {"origin": "http://127.0.0.1:9000", "retry_wait": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.tiktok.origin, "http://127.0.0.1:9000");
        assert_eq!(config.tiktok.retry_wait, Duration::from_millis(10));
        assert_eq!(config.tiktok.attempts, 3);
    }
}
