//! Routekeeper - control plane for a Redis-configured reverse proxy
//!
//! This library manages the route table an external proxy engine reads:
//! - Encodes `host:path -> service[:port]` routes into the proxy's Redis key layout
//! - Discovers routable services on a Docker swarm overlay network
//! - Flags routes whose target service has disappeared (orphans)
//! - Guards adds and renames against colliding route identities
//! - Stores bcrypt-hashed operator credentials under the same prefix
//! - Serves a JSON admin API over HTTP or HTTPS

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod keyspace;
pub mod kv;
pub mod reconcile;
pub mod redis_backend;
pub mod routes;
pub mod users;
