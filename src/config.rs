pub const URL_VAR: &str = "HASS_URL";
pub const TOKEN_VAR: &str = "HASS_TOKEN";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing {0} env var")]
    Missing(&'static str),
}

/// Hub location and credentials, read once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Empty values count as missing. The token is checked first.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let token = require(TOKEN_VAR)?;
        let url = require(URL_VAR)?;
        Ok(Self { url, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn reads_both_values_unchanged() {
        let config = Config::from_lookup(lookup(&[
            (URL_VAR, "not even a url"),
            (TOKEN_VAR, "abc.def"),
        ]))
        .unwrap();
        assert_eq!(config.url, "not even a url");
        assert_eq!(config.token, "abc.def");
    }

    #[test]
    fn missing_url_is_reported() {
        let err = Config::from_lookup(lookup(&[(TOKEN_VAR, "abc")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(URL_VAR));
        assert_eq!(err.to_string(), "Missing HASS_URL env var");
    }

    #[test]
    fn missing_token_is_reported() {
        let err = Config::from_lookup(lookup(&[(URL_VAR, "http://hub:8123")])).unwrap_err();
        assert_eq!(err.to_string(), "Missing HASS_TOKEN env var");
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let err = Config::from_lookup(lookup(&[(URL_VAR, ""), (TOKEN_VAR, "abc")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(URL_VAR));
    }

    #[test]
    fn token_checked_before_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(TOKEN_VAR));
    }

    #[test]
    fn debug_hides_token() {
        let config = Config {
            url: "http://hub".into(),
            token: "secret".into(),
        };
        assert!(!format!("{config:?}").contains("secret"));
    }
}
