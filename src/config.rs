//! Process configuration read from the environment (a `.env` file is honored by `main`).
use crate::error::ConfigError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use url::Url;

pub const BASE_URL_VAR: &str = "TMDB_BASE_URL";
pub const TOKEN_VAR: &str = "TMDB_READ_ACCESS_TOKEN";
pub const TIMEOUT_VAR: &str = "TMDB_TIMEOUT_SECS";
pub const FAVORITES_PATH_VAR: &str = "CINESCOPE_FAVORITES_PATH";
pub const BIND_VAR: &str = "CINESCOPE_BIND";
pub const DEBOUNCE_VAR: &str = "CINESCOPE_SEARCH_DEBOUNCE_MS";

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_FAVORITES_PATH: &str = "data/movie-favorites.json";
const DEFAULT_BIND: &str = "127.0.0.1:3147";
const DEFAULT_DEBOUNCE_MS: u64 = 350;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: Url,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    pub favorites_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub search_debounce: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Both the base URL and the bearer token are required here; a client
    /// built by hand with [`Config::new`] may omit the token, in which case
    /// requests still go out and the upstream rejects them with a 401.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let raw_base = get(BASE_URL_VAR).ok_or(ConfigError::Missing(BASE_URL_VAR))?;
        let base_url = parse_base_url(&raw_base)?;
        let token = get(TOKEN_VAR).ok_or(ConfigError::Missing(TOKEN_VAR))?;

        let mut config = Config::new(base_url, Some(token));
        if let Some(raw) = get(TIMEOUT_VAR) {
            config.request_timeout = Duration::from_secs(parse_number(TIMEOUT_VAR, &raw)?);
        }
        if let Some(path) = get(FAVORITES_PATH_VAR) {
            config.favorites_path = PathBuf::from(path);
        }
        if let Some(raw) = get(BIND_VAR) {
            config.bind_addr = raw.parse().map_err(|e| ConfigError::Invalid {
                var: BIND_VAR,
                reason: format!("{e}"),
            })?;
        }
        if let Some(raw) = get(DEBOUNCE_VAR) {
            config.search_debounce = Duration::from_millis(parse_number(DEBOUNCE_VAR, &raw)?);
        }

        info!(
            "Configured upstream {} (timeout {}s)",
            config.base_url,
            config.request_timeout.as_secs()
        );
        Ok(config)
    }

    pub fn new(base_url: Url, access_token: Option<String>) -> Self {
        Self {
            base_url,
            access_token,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            favorites_path: PathBuf::from(DEFAULT_FAVORITES_PATH),
            bind_addr: DEFAULT_BIND
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 3147))),
            search_debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// Parses the upstream base URL, forcing a trailing slash so relative paths
/// join under it (`.../3` + `movie/1` would otherwise drop the `3`).
pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).map_err(|e| ConfigError::Invalid {
        var: BASE_URL_VAR,
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::Invalid {
            var: BASE_URL_VAR,
            reason: "not a base URL".to_string(),
        });
    }
    Ok(url)
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        reason: format!("'{raw}' is not a whole number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let err = Config::from_lookup(lookup(&[(BASE_URL_VAR, "https://api.example.org/3")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing(TOKEN_VAR));
    }

    #[test]
    fn blank_base_url_counts_as_missing() {
        let err = Config::from_lookup(lookup(&[(BASE_URL_VAR, "  "), (TOKEN_VAR, "t")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing(BASE_URL_VAR));
    }

    #[test]
    fn applies_defaults_and_overrides() {
        let config = Config::from_lookup(lookup(&[
            (BASE_URL_VAR, "https://api.example.org/3"),
            (TOKEN_VAR, "secret"),
            (TIMEOUT_VAR, "5"),
            (DEBOUNCE_VAR, "100"),
        ]))
        .unwrap();
        assert_eq!(config.base_url.as_str(), "https://api.example.org/3/");
        assert_eq!(config.access_token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.search_debounce, Duration::from_millis(100));
        assert_eq!(config.favorites_path, PathBuf::from(DEFAULT_FAVORITES_PATH));
        assert_eq!(config.bind_addr.port(), 3147);
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        let err = Config::from_lookup(lookup(&[
            (BASE_URL_VAR, "https://api.example.org/3"),
            (TOKEN_VAR, "secret"),
            (TIMEOUT_VAR, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == TIMEOUT_VAR));
    }
}
