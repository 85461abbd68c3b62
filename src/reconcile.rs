//! Joins stored routes with discovered services and guards route writes
//!
//! Orphan status is computed on every listing and never stored: a route is
//! an orphan when no eligible service matches its target. Matching is a
//! linear scan of the service list per route (O(routes x services)), which
//! is fine for an admin panel.
//!
//! `add_route` checks for an existing identity and then inserts; two
//! concurrent adds of the same identity can both pass the check, and the
//! later insert wins. The store offers no cross-key transaction to close
//! that window, and operators are trusted.

use crate::docker::{Service, SharedDiscovery};
use crate::error::{Error, Lookup, Result};
use crate::keyspace::{SourceIdentity, Target, DEFAULT_PORT};
use crate::routes::RouteStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A stored route decorated with its orphan status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub host: String,
    pub path: String,
    pub target: String,
    pub port: u16,
    pub is_orphan: bool,
}

impl Route {
    fn decorate(source: &SourceIdentity, target: &Target, services: &[Service]) -> Self {
        let encoded = target.encode();
        let is_orphan = !services.iter().any(|s| s.matches_target(&encoded));
        Self {
            host: source.host().to_string(),
            path: source.path().to_string(),
            target: target.name.clone(),
            port: target.port,
            is_orphan,
        }
    }

    pub fn source(&self) -> SourceIdentity {
        SourceIdentity::new(&self.host, Some(&self.path))
    }
}

/// Operator input for adding or replacing a route
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewRoute {
    pub host: String,
    #[serde(default)]
    pub path: Option<String>,
    pub target: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl NewRoute {
    pub fn new(host: &str, path: Option<&str>, target: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            path: path.map(str::to_string),
            target: target.to_string(),
            port,
        }
    }

    pub fn source(&self) -> SourceIdentity {
        SourceIdentity::new(&self.host, self.path.as_deref())
    }

    pub fn target(&self) -> Target {
        Target::new(self.target.trim(), self.port)
    }

    /// Shape checks that need no store or discovery round trip
    pub fn validate_fields(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::validation("host", "must not be empty"));
        }
        if host.contains([':', '/']) || host.contains(char::is_whitespace) {
            return Err(Error::validation(
                "host",
                format!("{:?} must not contain ':', '/' or whitespace", host),
            ));
        }

        if let Some(path) = self.path.as_deref().filter(|p| !p.is_empty()) {
            if !path.starts_with('/') {
                return Err(Error::validation("path", format!("{:?} must start with '/'", path)));
            }
            if path.contains(char::is_whitespace) {
                return Err(Error::validation(
                    "path",
                    format!("{:?} must not contain whitespace", path),
                ));
            }
        }

        let target = self.target.trim();
        if target.is_empty() {
            return Err(Error::validation("target", "must not be empty"));
        }
        if target.contains(':') || target.contains(char::is_whitespace) {
            return Err(Error::validation(
                "target",
                format!("{:?} must be a bare service name; set the port separately", target),
            ));
        }

        if self.port == 0 {
            return Err(Error::validation("port", "must be between 1 and 65535"));
        }

        Ok(())
    }
}

/// The reconciliation engine
#[derive(Clone)]
pub struct RouteManager {
    store: RouteStore,
    discovery: SharedDiscovery,
}

impl RouteManager {
    pub fn new(store: RouteStore, discovery: SharedDiscovery) -> Self {
        Self { store, discovery }
    }

    pub fn store(&self) -> &RouteStore {
        &self.store
    }

    /// Every route with orphan status, ordered by source identity
    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        let (mut stored, services) = tokio::try_join!(
            self.store.lookup_all(""),
            self.discovery.list_services(None)
        )?;
        stored.sort_by(|a, b| a.0.cmp(&b.0));

        let routes: Vec<Route> = stored
            .iter()
            .map(|(source, target)| Route::decorate(source, target, &services))
            .collect();

        debug!(
            routes = routes.len(),
            services = services.len(),
            orphaned = routes.iter().filter(|r| r.is_orphan).count(),
            "Reconciled routes"
        );
        Ok(routes)
    }

    pub async fn orphaned_routes(&self) -> Result<Vec<Route>> {
        let mut routes = self.list_routes().await?;
        routes.retain(|r| r.is_orphan);
        Ok(routes)
    }

    pub async fn get_route(&self, source: &SourceIdentity) -> Result<Lookup<Route>> {
        let Lookup::Found(target) = self.store.lookup(source).await? else {
            return Ok(Lookup::NotFound);
        };
        let services = self.discovery.list_services(Some(&target.name)).await?;
        Ok(Lookup::Found(Route::decorate(source, &target, &services)))
    }

    pub async fn list_services(&self) -> Result<Vec<Service>> {
        let mut services = self.discovery.list_services(None).await?;
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    /// Reject a route whose identity is taken or whose target is not routable
    pub async fn validate_new_route(&self, route: &NewRoute) -> Result<()> {
        route.validate_fields()?;

        let source = route.source();
        if self.store.lookup(&source).await?.is_found() {
            return Err(Error::validation(
                "source",
                format!("route \"{}\" already exists", source),
            ));
        }

        self.ensure_routable(&route.target().name).await
    }

    pub async fn add_route(&self, route: NewRoute) -> Result<()> {
        if let Err(e) = self.validate_new_route(&route).await {
            warn!(host = %route.host, target = %route.target, error = %e, "Route rejected");
            return Err(e);
        }

        let source = route.source();
        let target = route.target();

        // Narrow the window between validation and the write
        if self.store.lookup(&source).await?.is_found() {
            warn!(source = %source, "Route appeared during validation");
            return Err(Error::validation(
                "source",
                format!("route \"{}\" already exists", source),
            ));
        }

        self.store.insert(&source, &target).await?;
        info!(source = %source, target = %target, "Route added");
        Ok(())
    }

    /// Replace `existing` with `route`, possibly under a new identity
    pub async fn update_route(&self, existing: &SourceIdentity, route: NewRoute) -> Result<()> {
        route.validate_fields()?;

        let current = self
            .store
            .lookup(existing)
            .await?
            .or_else_err(|| Error::RouteNotFound(existing.to_string()))?;

        let source = route.source();
        let target = route.target();

        if source != *existing && self.store.lookup(&source).await?.is_found() {
            warn!(from = %existing, to = %source, "Route rename rejected; identity taken");
            return Err(Error::SourceExists(source.to_string()));
        }

        if target.name != current.name {
            self.ensure_routable(&target.name).await?;
        }

        self.store.update(existing, &source, &target).await?;
        info!(from = %existing, to = %source, target = %target, "Route updated");
        Ok(())
    }

    pub async fn delete_route(&self, source: &SourceIdentity) -> Result<()> {
        if !self.store.lookup(source).await?.is_found() {
            return Err(Error::RouteNotFound(source.to_string()));
        }
        self.store.delete(source).await?;
        info!(source = %source, "Route deleted");
        Ok(())
    }

    async fn ensure_routable(&self, service: &str) -> Result<()> {
        if self.discovery.has_service(service).await? {
            Ok(())
        } else {
            Err(Error::validation(
                "target",
                format!("service \"{}\" does not exist or is not routable", service),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ServiceDiscovery;
    use crate::keyspace::KeySpace;
    use crate::kv::MemoryBackend;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Discovery double returning a mutable, already-filtered service list
    #[derive(Default)]
    struct StaticDiscovery {
        services: Mutex<Vec<Service>>,
    }

    impl StaticDiscovery {
        fn with(services: Vec<Service>) -> Arc<Self> {
            Arc::new(Self {
                services: Mutex::new(services),
            })
        }

        fn set(&self, services: Vec<Service>) {
            *self.services.lock() = services;
        }
    }

    #[async_trait]
    impl ServiceDiscovery for StaticDiscovery {
        async fn list_services(&self, filter: Option<&str>) -> Result<Vec<Service>> {
            Ok(self
                .services
                .lock()
                .iter()
                .filter(|s| filter.map_or(true, |f| s.name.starts_with(f)))
                .cloned()
                .collect())
        }
    }

    fn service(name: &str, ports: &[u16]) -> Service {
        Service {
            name: name.to_string(),
            image: format!("{}:latest", name),
            ports: ports.to_vec(),
        }
    }

    fn manager(services: Vec<Service>) -> (Arc<MemoryBackend>, Arc<StaticDiscovery>, RouteManager) {
        let kv = Arc::new(MemoryBackend::new());
        let discovery = StaticDiscovery::with(services);
        let store = RouteStore::new(kv.clone(), KeySpace::new("proxy"));
        (kv, discovery.clone(), RouteManager::new(store, discovery))
    }

    fn id(host: &str, path: &str) -> SourceIdentity {
        SourceIdentity::new(host, Some(path))
    }

    #[tokio::test]
    async fn test_live_route_is_not_orphan() {
        let (_, _, mgr) = manager(vec![service("web", &[8080])]);
        mgr.store()
            .insert(&id("api.example.com", "/"), &Target::new("web", 8080))
            .await
            .unwrap();

        let routes = mgr.list_routes().await.unwrap();
        assert_eq!(
            routes,
            vec![Route {
                host: "api.example.com".to_string(),
                path: "/".to_string(),
                target: "web".to_string(),
                port: 8080,
                is_orphan: false,
            }]
        );
        assert!(mgr.orphaned_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_without_service_is_orphan() {
        let (_, discovery, mgr) = manager(vec![service("web", &[8080])]);
        mgr.store()
            .insert(&id("api.example.com", "/"), &Target::new("web", 8080))
            .await
            .unwrap();

        discovery.set(vec![service("api", &[80])]);

        let routes = mgr.list_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].is_orphan);

        let orphaned = mgr.orphaned_routes().await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].source(), id("api.example.com", "/"));
    }

    #[tokio::test]
    async fn test_route_to_unpublished_port_is_orphan() {
        let (_, _, mgr) = manager(vec![service("web", &[8080])]);
        mgr.store()
            .insert(&id("a.com", "/"), &Target::new("web", 9090))
            .await
            .unwrap();
        mgr.store()
            .insert(&id("b.com", "/"), &Target::new("web", 80))
            .await
            .unwrap();

        let routes = mgr.list_routes().await.unwrap();
        assert!(routes[0].is_orphan, "web:9090 is not published");
        assert!(!routes[1].is_orphan, "bare name matches the service");
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected_without_mutation() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80]), service("other", &[80])]);
        mgr.add_route(NewRoute::new("a.com", Some("/"), "svc", 80))
            .await
            .unwrap();
        let before = kv.snapshot();

        let err = mgr
            .add_route(NewRoute::new("a.com", Some("/"), "other", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "source", .. }));
        assert_eq!(kv.snapshot(), before);
        assert_eq!(
            mgr.store().lookup(&id("a.com", "/")).await.unwrap(),
            Lookup::Found(Target::new("svc", 80))
        );
    }

    #[tokio::test]
    async fn test_add_default_path_collides_with_explicit_root() {
        let (_, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("A.com", None, "svc", 80)).await.unwrap();
        let err = mgr
            .add_route(NewRoute::new("a.com", Some("/"), "svc", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_service() {
        let (kv, _, mgr) = manager(vec![service("webapp", &[80])]);
        let err = mgr
            .add_route(NewRoute::new("a.com", None, "web", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "target", .. }));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_malformed_fields() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80])]);
        for route in [
            NewRoute::new("", None, "svc", 80),
            NewRoute::new("a.com:8080", None, "svc", 80),
            NewRoute::new("a.com", Some("api"), "svc", 80),
            NewRoute::new("a.com", None, "svc:8080", 80),
            NewRoute::new("a.com", None, "", 80),
            NewRoute::new("a.com", None, "svc", 0),
        ] {
            assert!(
                matches!(mgr.add_route(route.clone()).await, Err(Error::Validation { .. })),
                "{:?} should be rejected",
                route
            );
        }
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_add_encodes_port() {
        let (kv, _, mgr) = manager(vec![service("svc", &[8080])]);
        mgr.add_route(NewRoute::new("a.com", Some("/api"), "svc", 8080))
            .await
            .unwrap();
        mgr.add_route(NewRoute::new("b.com", None, "svc", 80))
            .await
            .unwrap();

        let snapshot = kv.snapshot();
        assert_eq!(snapshot.get("proxy:routes:a.com:/api"), Some(&"svc:8080".to_string()));
        assert_eq!(snapshot.get("proxy:routes:b.com:/"), Some(&"svc".to_string()));
    }

    #[tokio::test]
    async fn test_update_target_only_never_source_exists() {
        let (_, _, mgr) = manager(vec![service("svc", &[80, 9000])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();

        mgr.update_route(&id("a.com", "/"), NewRoute::new("a.com", None, "svc", 9000))
            .await
            .unwrap();
        assert_eq!(
            mgr.store().lookup(&id("a.com", "/")).await.unwrap(),
            Lookup::Found(Target::new("svc", 9000))
        );
    }

    #[tokio::test]
    async fn test_update_rename() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80]), service("next", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();

        mgr.update_route(&id("a.com", "/"), NewRoute::new("b.com", Some("/v2"), "next", 80))
            .await
            .unwrap();

        let snapshot = kv.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("proxy:routes:b.com:/v2"), Some(&"next".to_string()));
    }

    #[tokio::test]
    async fn test_update_onto_taken_identity_rejected() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();
        mgr.add_route(NewRoute::new("b.com", None, "svc", 80)).await.unwrap();
        let before = kv.snapshot();

        let err = mgr
            .update_route(&id("a.com", "/"), NewRoute::new("b.com", None, "svc", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceExists(ref s) if s == "b.com:/"));
        assert_eq!(kv.snapshot(), before);
    }

    #[tokio::test]
    async fn test_store_update_raises_source_exists_when_race_lost() {
        let (_, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();
        mgr.add_route(NewRoute::new("b.com", None, "svc", 80)).await.unwrap();

        // The engine's pre-check passed earlier; the store still refuses
        let err = mgr
            .store()
            .update(&id("a.com", "/"), &id("b.com", "/"), &Target::new("svc", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceExists(_)));
        assert_eq!(
            mgr.store().lookup(&id("a.com", "/")).await.unwrap(),
            Lookup::Found(Target::new("svc", 80))
        );
    }

    #[tokio::test]
    async fn test_update_missing_route() {
        let (_, _, mgr) = manager(vec![service("svc", &[80])]);
        let err = mgr
            .update_route(&id("a.com", "/"), NewRoute::new("a.com", None, "svc", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_to_unknown_service_rejected() {
        let (_, discovery, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();

        let err = mgr
            .update_route(&id("a.com", "/"), NewRoute::new("a.com", None, "ghost", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "target", .. }));

        // Keeping an orphaned target is allowed
        discovery.set(vec![]);
        mgr.update_route(&id("a.com", "/"), NewRoute::new("a.com", Some("/x"), "svc", 80))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_missing_route() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();
        let before = kv.snapshot();

        let err = mgr.delete_route(&id("b.com", "/")).await.unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(ref s) if s == "b.com:/"));
        assert_eq!(kv.snapshot(), before);
    }

    #[tokio::test]
    async fn test_delete_route() {
        let (kv, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", None, "svc", 80)).await.unwrap();
        mgr.delete_route(&id("a.com", "/")).await.unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_get_route() {
        let (_, _, mgr) = manager(vec![service("svc", &[80])]);
        mgr.add_route(NewRoute::new("a.com", Some("/api"), "svc", 80))
            .await
            .unwrap();

        let route = mgr.get_route(&id("a.com", "/api")).await.unwrap().into_option().unwrap();
        assert_eq!(route.target, "svc");
        assert!(!route.is_orphan);
        assert_eq!(mgr.get_route(&id("a.com", "/")).await.unwrap(), Lookup::NotFound);
    }
}
