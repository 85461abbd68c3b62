//! Docker swarm service discovery
//!
//! A service is a routing candidate only when it is attached to the proxy
//! network and publishes at least one endpoint port. Results are fetched
//! fresh on every call.

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::models::Service as SwarmService;
use bollard::network::InspectNetworkOptions;
use bollard::service::ListServicesOptions;
use bollard::Docker;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An eligible backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    /// Image reference, informational only
    pub image: String,
    /// Target and published port numbers of the service endpoint
    pub ports: Vec<u16>,
}

impl Service {
    /// Whether a stored target (`name` or `name:port`) points at this service
    pub fn matches_target(&self, encoded: &str) -> bool {
        if encoded == self.name {
            return true;
        }
        encoded
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|port| port.parse::<u16>().ok())
            .is_some_and(|port| self.ports.contains(&port))
    }
}

/// Source of eligible services
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Eligible services, optionally narrowed by a name filter
    async fn list_services(&self, filter: Option<&str>) -> Result<Vec<Service>>;

    async fn has_service(&self, name: &str) -> Result<bool> {
        // The orchestrator's name filter is a prefix match
        Ok(self
            .list_services(Some(name))
            .await?
            .iter()
            .any(|s| s.name == name))
    }
}

pub type SharedDiscovery = Arc<dyn ServiceDiscovery>;

/// The proxy network as configured and as resolved by the daemon
#[derive(Debug, Clone)]
pub struct ProxyNetwork {
    pub name: String,
    pub id: Option<String>,
}

impl ProxyNetwork {
    /// Attachments reference networks by id, older specs sometimes by name
    pub fn matches(&self, reference: &str) -> bool {
        reference == self.name || self.id.as_deref() == Some(reference)
    }
}

/// Convert a swarm service into a routing candidate, or `None` if ineligible
pub fn eligible_service(service: &SwarmService, network: &ProxyNetwork) -> Option<Service> {
    let spec = service.spec.as_ref()?;
    let name = spec.name.clone()?;

    let task_networks = spec
        .task_template
        .as_ref()
        .and_then(|t| t.networks.as_ref())
        .into_iter()
        .flatten();
    let service_networks = spec.networks.as_ref().into_iter().flatten();
    let attached = task_networks
        .chain(service_networks)
        .filter_map(|n| n.target.as_deref())
        .any(|target| network.matches(target));

    let endpoint = service.endpoint.as_ref();
    let has_vip = endpoint
        .and_then(|e| e.virtual_ips.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|vip| vip.network_id.as_deref())
        .any(|id| network.matches(id));

    if !attached && !has_vip {
        debug!(service = %name, network = %network.name, "Service not in proxy network");
        return None;
    }

    let endpoint_ports = endpoint.and_then(|e| e.ports.as_ref());
    let Some(endpoint_ports) = endpoint_ports.filter(|p| !p.is_empty()) else {
        debug!(service = %name, "Service publishes no ports");
        return None;
    };

    let mut ports: Vec<u16> = endpoint_ports
        .iter()
        .flat_map(|p| [p.target_port, p.published_port])
        .flatten()
        .filter_map(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .collect();
    ports.sort_unstable();
    ports.dedup();

    let image = spec
        .task_template
        .as_ref()
        .and_then(|t| t.container_spec.as_ref())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();

    Some(Service { name, image, ports })
}

/// Discovers services through the Docker engine API
pub struct DockerDiscovery {
    client: Docker,
    proxy_network: String,
    timeout: Duration,
}

impl DockerDiscovery {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Configured docker_host
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's default socket
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let timeout = config.timeout();
        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host, timeout)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, timeout)?
        } else {
            Docker::connect_with_socket_defaults().map_err(|e| {
                Error::Discovery(format!(
                    "cannot connect to Docker daemon: {}. \
                     Set docker_host in [discovery] or the DOCKER_HOST environment variable",
                    e
                ))
            })?
        };

        let discovery = Self {
            client,
            proxy_network: config.proxy_network.clone(),
            timeout,
        };

        discovery.timed("ping", discovery.client.ping()).await?;

        debug!(network = %discovery.proxy_network, "Connected to Docker daemon");
        Ok(discovery)
    }

    fn connect_to_host(host: &str, timeout: Duration) -> Result<Docker> {
        let secs = timeout.as_secs().max(1);
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, secs, bollard::API_DEFAULT_VERSION).map_err(|e| {
                Error::Discovery(format!("cannot connect to Unix socket '{}': {}", socket_path, e))
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, secs, bollard::API_DEFAULT_VERSION).map_err(|e| {
                Error::Discovery(format!("cannot connect to TCP endpoint '{}': {}", host, e))
            })
        } else {
            Err(Error::Discovery(format!(
                "invalid docker_host '{}'; expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    /// Resolve the configured proxy network so attachments by id can be matched
    async fn resolve_network(&self) -> Result<ProxyNetwork> {
        let inspect = self
            .client
            .inspect_network(&self.proxy_network, None::<InspectNetworkOptions<String>>);
        let inspected = tokio::time::timeout(self.timeout, inspect)
            .await
            .map_err(|_| Error::Timeout {
                operation: "inspect network",
                after: self.timeout,
            })?;

        match inspected {
            Ok(network) => Ok(ProxyNetwork {
                name: network.name.unwrap_or_else(|| self.proxy_network.clone()),
                id: network.id,
            }),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(Error::Discovery(format!(
                "proxy network '{}' does not exist",
                self.proxy_network
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for DockerDiscovery {
    async fn list_services(&self, filter: Option<&str>) -> Result<Vec<Service>> {
        let network = self.resolve_network().await?;

        let mut filters = HashMap::new();
        if let Some(name) = filter {
            filters.insert("name".to_string(), vec![name.to_string()]);
        }
        let options = ListServicesOptions {
            filters,
            status: false,
        };

        let services = self
            .timed("list services", self.client.list_services(Some(options)))
            .await?;
        let total = services.len();

        let eligible: Vec<Service> = services
            .iter()
            .filter_map(|s| eligible_service(s, &network))
            .collect();

        debug!(
            filter = filter.unwrap_or("*"),
            total,
            eligible = eligible.len(),
            "Listed swarm services"
        );
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        EndpointPortConfig, NetworkAttachmentConfig, ServiceEndpoint, ServiceEndpointVirtualIps,
        ServiceSpec, TaskSpec, TaskSpecContainerSpec,
    };

    fn network() -> ProxyNetwork {
        ProxyNetwork {
            name: "proxy".to_string(),
            id: Some("n1abc".to_string()),
        }
    }

    fn port(target: i64, published: Option<i64>) -> EndpointPortConfig {
        EndpointPortConfig {
            target_port: Some(target),
            published_port: published,
            ..Default::default()
        }
    }

    fn swarm_service(name: &str, networks: &[&str], ports: Vec<EndpointPortConfig>) -> SwarmService {
        SwarmService {
            spec: Some(ServiceSpec {
                name: Some(name.to_string()),
                task_template: Some(TaskSpec {
                    container_spec: Some(TaskSpecContainerSpec {
                        image: Some(format!("registry.local/{}:latest", name)),
                        ..Default::default()
                    }),
                    networks: Some(
                        networks
                            .iter()
                            .map(|n| NetworkAttachmentConfig {
                                target: Some(n.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            endpoint: Some(ServiceEndpoint {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_eligible_service_by_network_id() {
        let svc = swarm_service("web", &["n1abc"], vec![port(8080, Some(30080))]);
        let service = eligible_service(&svc, &network()).unwrap();
        assert_eq!(service.name, "web");
        assert_eq!(service.image, "registry.local/web:latest");
        assert_eq!(service.ports, vec![8080, 30080]);
    }

    #[test]
    fn test_eligible_service_by_network_name() {
        let svc = swarm_service("web", &["proxy"], vec![port(80, None)]);
        assert!(eligible_service(&svc, &network()).is_some());
    }

    #[test]
    fn test_eligible_service_by_virtual_ip() {
        let mut svc = swarm_service("web", &[], vec![port(80, None)]);
        svc.endpoint.as_mut().unwrap().virtual_ips = Some(vec![ServiceEndpointVirtualIps {
            network_id: Some("n1abc".to_string()),
            addr: Some("10.0.0.5/24".to_string()),
            ..Default::default()
        }]);
        assert!(eligible_service(&svc, &network()).is_some());
    }

    #[test]
    fn test_service_outside_proxy_network_excluded() {
        let svc = swarm_service("db", &["backend"], vec![port(5432, Some(5432))]);
        assert!(eligible_service(&svc, &network()).is_none());
    }

    #[test]
    fn test_service_without_ports_excluded() {
        let svc = swarm_service("worker", &["proxy"], vec![]);
        assert!(eligible_service(&svc, &network()).is_none());

        let mut svc = swarm_service("worker", &["proxy"], vec![]);
        svc.endpoint = None;
        assert!(eligible_service(&svc, &network()).is_none());
    }

    #[test]
    fn test_service_without_spec_excluded() {
        assert!(eligible_service(&SwarmService::default(), &network()).is_none());
    }

    #[test]
    fn test_matches_target() {
        let service = Service {
            name: "web".to_string(),
            image: String::new(),
            ports: vec![80, 8080],
        };
        assert!(service.matches_target("web"));
        assert!(service.matches_target("web:8080"));
        assert!(!service.matches_target("web:9090"));
        assert!(!service.matches_target("webapp"));
        assert!(!service.matches_target("webapp:8080"));
        assert!(!service.matches_target("web:"));
    }

    struct Fixed(Vec<Service>);

    #[async_trait]
    impl ServiceDiscovery for Fixed {
        async fn list_services(&self, filter: Option<&str>) -> Result<Vec<Service>> {
            Ok(self
                .0
                .iter()
                .filter(|s| filter.map_or(true, |f| s.name.starts_with(f)))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_has_service_requires_exact_name() {
        let discovery = Fixed(vec![Service {
            name: "webapp".to_string(),
            image: String::new(),
            ports: vec![80],
        }]);
        assert!(discovery.has_service("webapp").await.unwrap());
        assert!(!discovery.has_service("web").await.unwrap());
    }
}
