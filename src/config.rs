use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: reqwest::Url,
    pub session_file: PathBuf,
    /// Log output; the terminal itself is owned by the board UI.
    pub log_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TASKY_API_URL is not a valid URL ({value}): {reason}")]
    InvalidApiUrl { value: String, reason: String },
}

impl ClientConfig {
    pub const DEFAULT_API_URL: &'static str = "http://localhost:5000/api/v1";
    pub const DEFAULT_SESSION_FILE: &'static str = ".tasky_session.json";
    pub const DEFAULT_LOG_FILE: &'static str = "tasky.log";

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var              | Default                        |
    /// |----------------------|--------------------------------|
    /// | `TASKY_API_URL`      | `http://localhost:5000/api/v1` |
    /// | `TASKY_SESSION_FILE` | `.tasky_session.json`          |
    /// | `TASKY_LOG_FILE`     | `tasky.log`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("TASKY_API_URL").unwrap_or_else(|| Self::DEFAULT_API_URL.into());
        let api_url = normalize_api_url(&api_url)?;

        let session_file = lookup("TASKY_SESSION_FILE")
            .unwrap_or_else(|| Self::DEFAULT_SESSION_FILE.into())
            .into();
        let log_file = lookup("TASKY_LOG_FILE")
            .unwrap_or_else(|| Self::DEFAULT_LOG_FILE.into())
            .into();

        Ok(Self {
            api_url,
            session_file,
            log_file,
        })
    }
}

fn normalize_api_url(raw: &str) -> Result<reqwest::Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidApiUrl {
        value: raw.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(raw.trim().trim_end_matches('/'))
        .map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url.as_str(), ClientConfig::DEFAULT_API_URL);
        assert_eq!(config.session_file, PathBuf::from(".tasky_session.json"));
        assert_eq!(config.log_file, PathBuf::from("tasky.log"));
    }

    #[test]
    fn trailing_slash_is_dropped() {
        let config =
            ClientConfig::from_lookup(lookup(&[("TASKY_API_URL", "https://tasks.example/api/v1/")]))
                .unwrap();
        assert_eq!(config.api_url.as_str(), "https://tasks.example/api/v1");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("TASKY_API_URL", "not a url")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiUrl { .. }));

        let err = ClientConfig::from_lookup(lookup(&[("TASKY_API_URL", "ftp://tasks.example")]))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
