use axum::http::HeaderMap;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Error;

pub const GLOBAL_IDENTIFIER: &str = "global";
const ANONYMOUS_IDENTIFIER: &str = "api_key:anonymous";
const API_KEY_HEADER: &str = "x-api-key";

/// Issued API keys, each mapped to the client name its quota is charged to.
///
/// Parsed from comma-separated `name=key` pairs. Keys are never printed and
/// never become identifiers; only client names do.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeys {
    clients: Arc<HashMap<String, String>>,
}

impl ApiKeys {
    pub fn client(&self, key: &str) -> Option<&str> {
        self.clients.get(key).map(String::as_str)
    }
}

impl FromStr for ApiKeys {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut clients = HashMap::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, key) = entry
                .split_once('=')
                .map(|(name, key)| (name.trim(), key.trim()))
                .filter(|(name, key)| !name.is_empty() && !key.is_empty())
                .ok_or_else(|| Error::config_error("API keys must be listed as name=key"))?;

            if clients.insert(key.to_string(), name.to_string()).is_some() {
                return Err(Error::config_error(format!(
                    "API key for {} is issued more than once",
                    name
                )));
            }
        }

        if clients.is_empty() {
            return Err(Error::config_error("no API keys are issued"));
        }

        Ok(Self {
            clients: Arc::new(clients),
        })
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.clients.values()).finish()
    }
}

/// How a request is mapped to the identifier its rate limit is charged to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallerKey {
    /// Every caller shares a single quota.
    Global,
    /// Quota per peer IP address.
    ClientAddress,
    /// Quota per issued `x-api-key`; missing or unknown keys share one bucket.
    ApiKey(ApiKeys),
}

impl CallerKey {
    /// Builds the strategy named by `mode`. `api_key` mode needs the issued keys.
    pub fn new(mode: &str, api_keys: Option<&str>) -> Result<Self, Error> {
        match mode {
            "global" => Ok(Self::Global),
            "address" => Ok(Self::ClientAddress),
            "api_key" => {
                let keys = api_keys.ok_or_else(|| {
                    Error::config_error("RATE_LIMIT_API_KEYS is required for api_key mode")
                })?;

                Ok(Self::ApiKey(keys.parse()?))
            }
            _ => Err(Error::config_error(format!("unknown caller key {}", mode))),
        }
    }

    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        match self {
            Self::Global => GLOBAL_IDENTIFIER.into(),
            Self::ClientAddress => match peer {
                Some(addr) => format!("address:{}", addr.ip()),
                None => GLOBAL_IDENTIFIER.into(),
            },
            Self::ApiKey(keys) => headers
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|key| keys.client(key.trim()))
                .map(|client| format!("client:{}", client))
                .unwrap_or_else(|| ANONYMOUS_IDENTIFIER.into()),
        }
    }
}

#[cfg(test)]
fn api_key_mode() -> CallerKey {
    CallerKey::new("api_key", Some("team-a=sk-a-123, team-b=sk-b-456")).unwrap()
}

#[cfg(test)]
fn with_api_key(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(API_KEY_HEADER, key.parse().unwrap());
    headers
}

#[test]
fn global_ignores_caller() {
    let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();

    assert_eq!(
        CallerKey::Global.identify(&HeaderMap::new(), Some(peer)),
        CallerKey::Global.identify(&HeaderMap::new(), None),
    );
}

#[test]
fn address_uses_ip_only() {
    let a: SocketAddr = "10.0.0.1:5555".parse().unwrap();
    let b: SocketAddr = "10.0.0.1:6666".parse().unwrap();
    let c: SocketAddr = "10.0.0.2:5555".parse().unwrap();
    let headers = HeaderMap::new();

    let key = CallerKey::ClientAddress;
    assert_eq!(key.identify(&headers, Some(a)), key.identify(&headers, Some(b)));
    assert_ne!(key.identify(&headers, Some(a)), key.identify(&headers, Some(c)));
}

#[test]
fn issued_keys_map_to_client_names() {
    let key = api_key_mode();

    assert_eq!(key.identify(&with_api_key("sk-a-123"), None), "client:team-a");
    assert_eq!(key.identify(&with_api_key(" sk-b-456 "), None), "client:team-b");
    assert_eq!(key.identify(&HeaderMap::new(), None), "api_key:anonymous");
}

#[test]
fn unknown_keys_share_the_anonymous_bucket() {
    let key = api_key_mode();

    let identifiers: std::collections::HashSet<String> = (0..15)
        .map(|i| key.identify(&with_api_key(&format!("rotated-{}", i)), None))
        .collect();

    assert_eq!(identifiers.len(), 1);
    assert!(identifiers.contains("api_key:anonymous"));
}

#[test]
fn keys_never_appear_in_identifiers_or_logs() {
    let key = api_key_mode();

    for secret in ["sk-a-123", "sk-b-456", "sk-unknown"] {
        assert!(!key.identify(&with_api_key(secret), None).contains(secret));
        assert!(!format!("{:?}", key).contains(secret));
    }
}

#[test]
fn parse_caller_key() {
    assert_eq!(CallerKey::new("global", None).unwrap(), CallerKey::Global);
    assert_eq!(CallerKey::new("address", None).unwrap(), CallerKey::ClientAddress);
    assert!(matches!(api_key_mode(), CallerKey::ApiKey(_)));

    assert!(CallerKey::new("session", None).is_err());
    assert!(CallerKey::new("api_key", None).is_err());
    assert!(CallerKey::new("api_key", Some("")).is_err());
    assert!(CallerKey::new("api_key", Some("team-a")).is_err());
    assert!(CallerKey::new("api_key", Some("=sk-a")).is_err());
    assert!(CallerKey::new("api_key", Some("team-a=sk-a,team-b=sk-a")).is_err());
}
