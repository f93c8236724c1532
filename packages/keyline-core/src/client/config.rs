use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default backend API URL
const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Default bound on a single refresh call
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

/// Default transport timeout for business requests
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Environment variable name for API URL override
pub const ENV_API_URL: &str = "KEYLINE_API_URL";

/// Environment variable name for refresh timeout override (seconds)
pub const ENV_REFRESH_TIMEOUT: &str = "KEYLINE_REFRESH_TIMEOUT_SECS";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub api: Option<ApiSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApiSection {
    /// API endpoint URL (e.g., "https://dashboard.example.com/api")
    pub api_url: Option<String>,
    pub refresh_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub refresh_path: Option<String>,
    pub login_path: Option<String>,
    pub logout_path: Option<String>,
    pub profile_path: Option<String>,
}

/// Runtime client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for API calls
    pub api_url: String,
    /// Upper bound on one refresh call; past it the wave fails
    pub refresh_timeout: Duration,
    /// Transport timeout for every request
    pub request_timeout: Duration,
    pub refresh_path: String,
    pub login_path: String,
    pub logout_path: String,
    pub profile_path: String,
    /// Source of the API URL (for logging)
    pub source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_path: "/auth/refresh".to_string(),
            login_path: "/auth/login".to_string(),
            logout_path: "/auth/logout".to_string(),
            profile_path: "/auth/me".to_string(),
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Configuration pointing at `api_url` with all other values defaulted.
    pub fn for_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: normalize_url(&api_url.into()),
            ..Self::default()
        }
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("keyline").join("config.toml"))
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load client configuration with priority:
/// 1. Environment variables (KEYLINE_API_URL, KEYLINE_REFRESH_TIMEOUT_SECS)
/// 2. Config file (~/.config/keyline/config.toml)
/// 3. Default values
pub fn load_client_config() -> ClientConfig {
    resolve_config(
        std::env::var(ENV_API_URL).ok(),
        std::env::var(ENV_REFRESH_TIMEOUT).ok(),
        load_config_file(),
    )
}

/// Merge the configuration layers. Split out of [`load_client_config`] so it
/// can be exercised without touching the process environment.
pub fn resolve_config(
    env_url: Option<String>,
    env_refresh_timeout: Option<String>,
    file: Option<ConfigFile>,
) -> ClientConfig {
    let mut config = ClientConfig::default();
    let section = file.and_then(|f| f.api).unwrap_or_default();

    let env_url = env_url.map(|u| normalize_url(&u)).filter(|u| !u.is_empty());
    let file_url = section
        .api_url
        .as_deref()
        .map(normalize_url)
        .filter(|u| !u.is_empty());

    // Priority 1: Environment variable
    if let Some(url) = env_url {
        tracing::info!("Using API URL from environment variable: {}", url);
        config.api_url = url;
        config.source = ConfigSource::Environment;
    // Priority 2: Config file
    } else if let Some(url) = file_url {
        tracing::info!("Using API URL from config file: {}", url);
        config.api_url = url;
        config.source = ConfigSource::ConfigFile;
    } else {
        // Priority 3: Default values
        tracing::debug!("Using default API URL: {}", DEFAULT_API_URL);
    }

    let env_timeout = env_refresh_timeout.and_then(|raw| match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            tracing::warn!("Ignoring invalid {}={:?}", ENV_REFRESH_TIMEOUT, raw);
            None
        }
    });
    if let Some(secs) = env_timeout.or(section.refresh_timeout_secs.filter(|s| *s > 0)) {
        config.refresh_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = section.request_timeout_secs.filter(|s| *s > 0) {
        config.request_timeout = Duration::from_secs(secs);
    }

    if let Some(path) = section.refresh_path {
        config.refresh_path = path;
    }
    if let Some(path) = section.login_path {
        config.login_path = path;
    }
    if let Some(path) = section.logout_path {
        config.logout_path = path;
    }
    if let Some(path) = section.profile_path {
        config.profile_path = path;
    }

    config
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/keyline/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Keyline Configuration
# Place this file at: ~/.config/keyline/config.toml

[api]
# Backend API endpoint
# Default: http://localhost:8080/api
# api_url = "https://dashboard.example.com/api"

# Seconds a token refresh may take before queued requests are failed
# refresh_timeout_secs = 10

# Transport timeout for every request, in seconds
# request_timeout_secs = 30

# Endpoint paths, relative to api_url
# refresh_path = "/auth/refresh"
# login_path = "/auth/login"
# logout_path = "/auth/logout"
# profile_path = "/auth/me"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(toml_src: &str) -> Option<ConfigFile> {
        Some(toml::from_str(toml_src).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = resolve_config(None, None, None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.source, ConfigSource::Default);
        assert_eq!(config.refresh_timeout, Duration::from_secs(10));
        assert_eq!(config.refresh_path, "/auth/refresh");
    }

    #[test]
    fn test_environment_wins_over_file() {
        let config = resolve_config(
            Some(" https://env.example.com/api/ ".to_string()),
            Some("3".to_string()),
            file("[api]\napi_url = \"https://file.example.com/api\"\nrefresh_timeout_secs = 20\n"),
        );
        assert_eq!(config.api_url, "https://env.example.com/api");
        assert_eq!(config.source, ConfigSource::Environment);
        assert_eq!(config.refresh_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_file_values() {
        let config = resolve_config(
            Some("   ".to_string()),
            Some("soon".to_string()),
            file(
                "[api]\napi_url = \"https://file.example.com/api\"\nrefresh_timeout_secs = 20\nrefresh_path = \"/session/renew\"\n",
            ),
        );
        assert_eq!(config.api_url, "https://file.example.com/api");
        assert_eq!(config.source, ConfigSource::ConfigFile);
        assert_eq!(config.refresh_timeout, Duration::from_secs(20));
        assert_eq!(config.refresh_path, "/session/renew");
        assert_eq!(config.login_path, "/auth/login");
    }

    #[test]
    fn test_example_config_parses() {
        let parsed: ConfigFile = toml::from_str(&generate_example_config()).unwrap();
        assert!(parsed.api.unwrap().api_url.is_none());
    }
}
