//! Provider configuration
//!
//! Options can be loaded from a JSON file or from `BLOBCACHE_*` environment
//! variables. A configuration is only usable after `validate()` has turned
//! it into a resolved [`Credential`].

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::freshness::MAX_TTL;
use crate::error::ConfigError;

/// Default trust window for cached files, in seconds
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 300;

/// Default query parameter that bypasses the local cache
pub const DEFAULT_IGNORE_CACHE_QUERY_KEY: &str = "ignoreCache";

/// Directory under the system temp dir used when no cache root is configured
const TEMP_SUBPATH: &str = "blobcache";

/// How a single-file lookup matches remote object names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    /// The object name must equal the requested path
    #[default]
    Exact,
    /// The first object whose name starts with the requested path wins
    Prefix,
}

impl FromStr for LookupMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(LookupMode::Exact),
            "prefix" => Ok(LookupMode::Prefix),
            _ => Err(ConfigError::InvalidValue {
                name: "lookupMode",
                value: s.to_string(),
            }),
        }
    }
}

/// Raw provider options, as written by the operator
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// Name of the remote container (B2 bucket)
    pub container_name: String,
    /// Container (bucket) id; required with the token credential form
    pub container_id: Option<String>,
    /// `KeyId=...;ApplicationKey=...`
    pub connection_string: Option<String>,
    /// API endpoint that issued `token`
    pub service_uri: Option<String>,
    /// Pre-issued authorization token
    pub token: Option<String>,
    /// Absolute cache root; a temp subdirectory is used when unset
    pub local_cache_root: Option<PathBuf>,
    /// Trust window in seconds
    pub local_cache_timeout: u64,
    /// Query parameter that forces a remote check for one request
    pub ignore_cache_query_key: String,
    pub lookup_mode: LookupMode,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            container_name: String::new(),
            container_id: None,
            connection_string: None,
            service_uri: None,
            token: None,
            local_cache_root: None,
            local_cache_timeout: DEFAULT_CACHE_TIMEOUT_SECS,
            ignore_cache_query_key: DEFAULT_IGNORE_CACHE_QUERY_KEY.to_string(),
            lookup_mode: LookupMode::default(),
        }
    }
}

/// Resolved credential form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Application key pair, authorized against the account endpoint
    ApplicationKey { key_id: String, key: String },
    /// Token already issued for `service_uri`
    Token {
        service_uri: String,
        token: String,
        container_id: String,
    },
}

impl ProviderConfig {
    /// Create a config for a container with every other option defaulted
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load options from `BLOBCACHE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::new(var("BLOBCACHE_CONTAINER_NAME").unwrap_or_default());

        config.container_id = non_empty("BLOBCACHE_CONTAINER_ID");
        config.connection_string = non_empty("BLOBCACHE_CONNECTION_STRING");
        config.service_uri = non_empty("BLOBCACHE_SERVICE_URI");
        config.token = non_empty("BLOBCACHE_TOKEN");
        config.local_cache_root = non_empty("BLOBCACHE_LOCAL_CACHE_ROOT").map(PathBuf::from);

        if let Some(timeout) = non_empty("BLOBCACHE_LOCAL_CACHE_TIMEOUT") {
            config.local_cache_timeout = timeout.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "localCacheTimeout",
                value: timeout.clone(),
            })?;
        }
        if let Some(key) = var("BLOBCACHE_IGNORE_CACHE_QUERY_KEY") {
            config.ignore_cache_query_key = key;
        }
        if let Some(mode) = non_empty("BLOBCACHE_LOOKUP_MODE") {
            config.lookup_mode = mode.parse()?;
        }

        Ok(config)
    }

    /// Check the options and resolve the credential form
    pub fn validate(&self) -> Result<Credential, ConfigError> {
        if self.container_name.trim().is_empty() {
            return Err(ConfigError::MissingContainerName);
        }
        if self.ignore_cache_query_key.trim().is_empty() {
            return Err(ConfigError::MissingIgnoreCacheQueryKey);
        }
        if self.local_cache_timeout > MAX_TTL.as_secs() {
            return Err(ConfigError::InvalidValue {
                name: "localCacheTimeout",
                value: self.local_cache_timeout.to_string(),
            });
        }

        let has_token_part = self.service_uri.is_some() || self.token.is_some();
        match (&self.connection_string, &self.service_uri, &self.token) {
            (Some(_), _, _) if has_token_part => Err(ConfigError::AmbiguousCredential),
            (Some(conn), None, None) => parse_connection_string(conn),
            (None, Some(uri), Some(token)) => {
                let container_id = self
                    .container_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .ok_or(ConfigError::MissingContainerId)?;
                Ok(Credential::Token {
                    service_uri: uri.trim_end_matches('/').to_string(),
                    token: token.clone(),
                    container_id,
                })
            }
            _ => Err(ConfigError::MissingCredential),
        }
    }

    /// Trust window as a duration
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.local_cache_timeout)
    }

    /// Cache root to use, namespaced by account and container when unset
    pub fn cache_root(&self, account: &str) -> PathBuf {
        match &self.local_cache_root {
            Some(root) if !root.as_os_str().is_empty() => root.clone(),
            _ => env::temp_dir()
                .join(TEMP_SUBPATH)
                .join(account)
                .join(&self.container_name),
        }
    }
}

/// Parse `KeyId=...;ApplicationKey=...` (keys are case-insensitive)
fn parse_connection_string(conn: &str) -> Result<Credential, ConfigError> {
    let mut key_id = None;
    let mut key = None;

    for part in conn.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidConnectionString(format!("malformed segment '{}'", part)))?;
        match name.trim().to_ascii_lowercase().as_str() {
            "keyid" | "applicationkeyid" => key_id = Some(value.trim().to_string()),
            "applicationkey" | "key" => key = Some(value.trim().to_string()),
            other => {
                return Err(ConfigError::InvalidConnectionString(format!(
                    "unknown setting '{}'",
                    other
                )))
            }
        }
    }

    match (key_id, key) {
        (Some(key_id), Some(key)) if !key_id.is_empty() && !key.is_empty() => {
            Ok(Credential::ApplicationKey { key_id, key })
        }
        _ => Err(ConfigError::InvalidConnectionString(
            "KeyId and ApplicationKey are required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.local_cache_timeout, 300);
        assert_eq!(config.ignore_cache_query_key, "ignoreCache");
        assert_eq!(config.lookup_mode, LookupMode::Exact);
    }

    #[test]
    fn test_missing_container_name() {
        let mut config = ProviderConfig::new("  ");
        config.connection_string = Some("KeyId=a;ApplicationKey=b".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingContainerName)
        ));
    }

    #[test]
    fn test_missing_credential() {
        let config = ProviderConfig::new("files");
        assert!(matches!(config.validate(), Err(ConfigError::MissingCredential)));

        // A token without its endpoint is not a complete form
        let mut partial = ProviderConfig::new("files");
        partial.token = Some("tok".to_string());
        assert!(matches!(partial.validate(), Err(ConfigError::MissingCredential)));
    }

    #[test]
    fn test_ambiguous_credential() {
        let mut config = ProviderConfig::new("files");
        config.connection_string = Some("KeyId=a;ApplicationKey=b".to_string());
        config.service_uri = Some("https://api.example.com".to_string());
        config.token = Some("tok".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AmbiguousCredential)
        ));
    }

    #[test]
    fn test_connection_string() {
        let mut config = ProviderConfig::new("files");
        config.connection_string = Some(" keyid=004abc ; ApplicationKey=K004xyz;".to_string());
        assert_eq!(
            config.validate().unwrap(),
            Credential::ApplicationKey {
                key_id: "004abc".to_string(),
                key: "K004xyz".to_string(),
            }
        );

        config.connection_string = Some("KeyId=004abc".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_token_form_requires_container_id() {
        let mut config = ProviderConfig::new("files");
        config.service_uri = Some("https://api004.backblazeb2.com/".to_string());
        config.token = Some("4_token".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::MissingContainerId)));

        config.container_id = Some("bucket123".to_string());
        assert_eq!(
            config.validate().unwrap(),
            Credential::Token {
                service_uri: "https://api004.backblazeb2.com".to_string(),
                token: "4_token".to_string(),
                container_id: "bucket123".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_ignore_cache_key() {
        let mut config = ProviderConfig::new("files");
        config.connection_string = Some("KeyId=a;ApplicationKey=b".to_string());
        config.ignore_cache_query_key = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingIgnoreCacheQueryKey)
        ));
    }

    #[test]
    fn test_cache_timeout_range() {
        let mut config = ProviderConfig::new("files");
        config.connection_string = Some("KeyId=a;ApplicationKey=b".to_string());

        config.local_cache_timeout = MAX_TTL.as_secs();
        assert!(config.validate().is_ok());

        for timeout in [MAX_TTL.as_secs() + 1, 100_000_000_000, u64::MAX] {
            config.local_cache_timeout = timeout;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue {
                    name: "localCacheTimeout",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_from_vars() {
        let config = ProviderConfig::from_vars(vars(&[
            ("BLOBCACHE_CONTAINER_NAME", "files"),
            ("BLOBCACHE_CONNECTION_STRING", "KeyId=a;ApplicationKey=b"),
            ("BLOBCACHE_LOCAL_CACHE_TIMEOUT", "60"),
            ("BLOBCACHE_LOOKUP_MODE", "Prefix"),
            ("BLOBCACHE_SERVICE_URI", ""),
        ]))
        .unwrap();

        assert_eq!(config.container_name, "files");
        assert_eq!(config.cache_timeout(), Duration::from_secs(60));
        assert_eq!(config.lookup_mode, LookupMode::Prefix);
        assert!(config.service_uri.is_none());
        assert!(config.validate().is_ok());

        let bad = ProviderConfig::from_vars(vars(&[("BLOBCACHE_LOCAL_CACHE_TIMEOUT", "soon")]));
        assert!(matches!(bad, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "containerName": "files",
                "connectionString": "KeyId=a;ApplicationKey=b",
                "localCacheTimeout": 30,
                "lookupMode": "prefix"
            }"#,
        )
        .unwrap();

        let config = ProviderConfig::from_file(&path).unwrap();
        assert_eq!(config.container_name, "files");
        assert_eq!(config.local_cache_timeout, 30);
        assert_eq!(config.lookup_mode, LookupMode::Prefix);
        assert_eq!(config.ignore_cache_query_key, "ignoreCache");

        let missing = ProviderConfig::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_default_cache_root() {
        let config = ProviderConfig::new("files");
        let root = config.cache_root("acct");
        assert!(root.starts_with(env::temp_dir()));
        assert!(root.ends_with(Path::new("blobcache/acct/files")));

        let mut explicit = ProviderConfig::new("files");
        explicit.local_cache_root = Some(PathBuf::from("/srv/cache"));
        assert_eq!(explicit.cache_root("acct"), PathBuf::from("/srv/cache"));
    }
}
