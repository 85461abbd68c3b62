//! Translation between routes/credentials and the flat Redis key space
//!
//! Routes live under `{prefix:}routes:{host}:{path}` with the path always
//! present (`/` included), and map to `{target}` or `{target}:{port}`.
//! Credentials live under `{prefix:}users:{username}`. Everything here is
//! pure; the store adapters do the I/O.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;

/// Port assumed when a target value carries no `:port` suffix
pub const DEFAULT_PORT: u16 = 80;

/// Path assumed when a route is registered for a whole host
pub const DEFAULT_PATH: &str = "/";

/// The unique `host:path` identity of a route
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceIdentity {
    host: String,
    path: String,
}

impl SourceIdentity {
    /// Build an identity, lowercasing the host and defaulting the path to `/`
    pub fn new(host: &str, path: Option<&str>) -> Self {
        let path = match path {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => DEFAULT_PATH.to_string(),
        };
        Self {
            host: host.trim().to_ascii_lowercase(),
            path,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

/// A backend service name plus the port the proxy should forward to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub name: String,
    pub port: u16,
}

impl Target {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// Persisted form: the bare name on the default port, `name:port` otherwise
    pub fn encode(&self) -> String {
        encode_target(&self.name, self.port)
    }

    pub fn decode(value: &str) -> Result<Self> {
        decode_target(value).map(|(name, port)| Self { name, port })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub fn encode_target(target: &str, port: u16) -> String {
    if port == DEFAULT_PORT {
        target.to_string()
    } else {
        format!("{}:{}", target, port)
    }
}

/// Split a stored target on its last `:`; no separator means the default port
pub fn decode_target(value: &str) -> Result<(String, u16)> {
    let (name, port) = match value.rsplit_once(':') {
        Some((name, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Decode(format!("invalid port in target {:?}", value)))?;
            if port == 0 {
                return Err(Error::Decode(format!("port 0 in target {:?}", value)));
            }
            (name, port)
        }
        None => (value, DEFAULT_PORT),
    };

    if name.is_empty() {
        return Err(Error::Decode(format!("empty service name in target {:?}", value)));
    }

    Ok((name.to_string(), port))
}

/// Key namespaces under the configured prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Routes,
    Users,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Routes => "routes",
            Namespace::Users => "users",
        }
    }
}

/// Key builder bound to one prefix
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// An empty prefix yields unprefixed keys (`routes:...`)
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespace(&self, ns: Namespace) -> String {
        if self.prefix.is_empty() {
            format!("{}:", ns.as_str())
        } else {
            format!("{}:{}:", self.prefix, ns.as_str())
        }
    }

    pub fn encode_route_key(&self, source: &SourceIdentity) -> String {
        format!("{}{}", self.namespace(Namespace::Routes), source)
    }

    pub fn decode_route_key(&self, key: &str) -> Result<SourceIdentity> {
        let rest = self.strip_namespace(Namespace::Routes, key)?;
        // Hosts never contain ':', so the first separator ends the host
        let (host, path) = rest
            .split_once(':')
            .ok_or_else(|| Error::Decode(format!("route key without path: {:?}", key)))?;
        if host.is_empty() || path.is_empty() {
            return Err(Error::Decode(format!("malformed route key: {:?}", key)));
        }
        let source = SourceIdentity::new(host, Some(path));
        // A mixed-case host is a key the proxy will never match
        if source.host() != host {
            return Err(Error::Decode(format!(
                "route key with non-normalized host: {:?}",
                key
            )));
        }
        Ok(source)
    }

    /// Normalized identity for a route key whose host is not lowercase
    pub fn denormalized_route_source(&self, key: &str) -> Option<SourceIdentity> {
        let rest = self.strip_namespace(Namespace::Routes, key).ok()?;
        let (host, path) = rest.split_once(':')?;
        if host.is_empty() || path.is_empty() {
            return None;
        }
        let source = SourceIdentity::new(host, Some(path));
        (source.host() != host).then_some(source)
    }

    /// Host of a legacy route key that was written without its path segment
    pub fn legacy_route_host(&self, key: &str) -> Option<String> {
        let rest = self.strip_namespace(Namespace::Routes, key).ok()?;
        if rest.is_empty() || rest.contains(':') {
            None
        } else {
            Some(rest.to_string())
        }
    }

    pub fn encode_user_key(&self, username: &str) -> String {
        format!("{}{}", self.namespace(Namespace::Users), username)
    }

    pub fn decode_user_key(&self, key: &str) -> Result<String> {
        let username = self.strip_namespace(Namespace::Users, key)?;
        if username.is_empty() {
            return Err(Error::Decode(format!("user key without name: {:?}", key)));
        }
        Ok(username.to_string())
    }

    /// Store glob for a caller filter, confined to one namespace; empty means all
    pub fn match_pattern(&self, ns: Namespace, pattern: &str) -> String {
        let pattern = if pattern.is_empty() { "*" } else { pattern };
        format!("{}{}", self.namespace(ns), pattern)
    }

    fn strip_namespace<'a>(&self, ns: Namespace, key: &'a str) -> Result<&'a str> {
        let namespace = self.namespace(ns);
        key.strip_prefix(namespace.as_str()).ok_or_else(|| {
            Error::Decode(format!("key {:?} outside namespace {:?}", key, namespace))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_target_roundtrip() {
        assert_eq!(encode_target("web", 80), "web");
        assert_eq!(decode_target("web").unwrap(), ("web".to_string(), 80));
    }

    #[test]
    fn test_custom_port_target_roundtrip() {
        for port in [1u16, 81, 443, 8080, 65535] {
            let encoded = encode_target("api-svc", port);
            assert_eq!(encoded, format!("api-svc:{}", port));
            assert_eq!(decode_target(&encoded).unwrap(), ("api-svc".to_string(), port));
        }
    }

    #[test]
    fn test_explicit_default_port_decodes() {
        assert_eq!(decode_target("web:80").unwrap(), ("web".to_string(), 80));
    }

    #[test]
    fn test_decode_target_rejects_corruption() {
        assert!(matches!(decode_target(""), Err(Error::Decode(_))));
        assert!(matches!(decode_target(":8080"), Err(Error::Decode(_))));
        assert!(matches!(decode_target("web:"), Err(Error::Decode(_))));
        assert!(matches!(decode_target("web:http"), Err(Error::Decode(_))));
        assert!(matches!(decode_target("web:0"), Err(Error::Decode(_))));
        assert!(matches!(decode_target("web:70000"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_source_identity_normalizes() {
        let id = SourceIdentity::new("API.Example.com", None);
        assert_eq!(id.host(), "api.example.com");
        assert_eq!(id.path(), "/");
        assert_eq!(id.to_string(), "api.example.com:/");

        let id = SourceIdentity::new("a.com", Some(""));
        assert_eq!(id.path(), "/");
    }

    #[test]
    fn test_route_key_always_carries_path() {
        let ks = KeySpace::new("proxy");
        let key = ks.encode_route_key(&SourceIdentity::new("a.com", None));
        assert_eq!(key, "proxy:routes:a.com:/");

        let key = ks.encode_route_key(&SourceIdentity::new("a.com", Some("/api/v1")));
        assert_eq!(key, "proxy:routes:a.com:/api/v1");
    }

    #[test]
    fn test_route_key_decode() {
        let ks = KeySpace::new("proxy");
        let id = ks.decode_route_key("proxy:routes:a.com:/api:v2").unwrap();
        assert_eq!(id.host(), "a.com");
        assert_eq!(id.path(), "/api:v2");

        assert!(ks.decode_route_key("proxy:routes:a.com").is_err());
        assert!(ks.decode_route_key("proxy:users:alice").is_err());
        assert!(ks.decode_route_key("other:routes:a.com:/").is_err());
    }

    #[test]
    fn test_route_key_decode_rejects_mixed_case_host() {
        let ks = KeySpace::new("proxy");
        assert!(matches!(
            ks.decode_route_key("proxy:routes:A.com:/"),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            ks.decode_route_key("proxy:routes: a.com:/"),
            Err(Error::Decode(_))
        ));
        // Paths keep their case
        assert_eq!(
            ks.decode_route_key("proxy:routes:a.com:/API").unwrap().path(),
            "/API"
        );

        let source = ks.denormalized_route_source("proxy:routes:A.com:/x").unwrap();
        assert_eq!(source.to_string(), "a.com:/x");
        assert!(ks.denormalized_route_source("proxy:routes:a.com:/x").is_none());
        assert!(ks.denormalized_route_source("proxy:routes:A.com").is_none());
    }

    #[test]
    fn test_unprefixed_keys() {
        let ks = KeySpace::new("");
        assert_eq!(
            ks.encode_route_key(&SourceIdentity::new("a.com", None)),
            "routes:a.com:/"
        );
        assert_eq!(ks.encode_user_key("alice"), "users:alice");
        assert_eq!(ks.match_pattern(Namespace::Routes, ""), "routes:*");
    }

    #[test]
    fn test_legacy_route_host() {
        let ks = KeySpace::new("proxy");
        assert_eq!(ks.legacy_route_host("proxy:routes:a.com"), Some("a.com".to_string()));
        assert_eq!(ks.legacy_route_host("proxy:routes:a.com:/"), None);
        assert_eq!(ks.legacy_route_host("proxy:users:a.com"), None);
    }

    #[test]
    fn test_match_pattern_confined_to_namespace() {
        let ks = KeySpace::new("proxy");
        assert_eq!(ks.match_pattern(Namespace::Routes, ""), "proxy:routes:*");
        assert_eq!(
            ks.match_pattern(Namespace::Routes, "*.example.com:*"),
            "proxy:routes:*.example.com:*"
        );
        assert_eq!(ks.match_pattern(Namespace::Users, "a*"), "proxy:users:a*");
    }

    #[test]
    fn test_user_key_roundtrip() {
        let ks = KeySpace::new("proxy");
        let key = ks.encode_user_key("alice");
        assert_eq!(key, "proxy:users:alice");
        assert_eq!(ks.decode_user_key(&key).unwrap(), "alice");
        assert!(ks.decode_user_key("proxy:users:").is_err());
    }
}
