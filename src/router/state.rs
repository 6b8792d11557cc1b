//! In-memory resolution state shared between the router and the proxy
//!
//! The database sync loop is the only writer; request paths only read.
//! Containers live in a concurrent map that is refreshed by snapshot
//! swap, and static routes live in a radix table behind a single
//! reader-writer lock. Keeping this state separate from the database
//! handle lets the proxy (and tests) work without a live database.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::debug;

use crate::error::RouteError;
use crate::router::radix::RouteTable;
use crate::router::{Container, StaticRoute};

/// Shared resolution state: container cache + static route table
#[derive(Debug, Default)]
pub struct RouteState {
    containers: DashMap<String, Arc<Container>>,
    table: RwLock<RouteTable>,
    routes: RwLock<Vec<StaticRoute>>,
}

impl RouteState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a routable container by id.
    pub fn resolve(&self, container_id: &str) -> Result<Arc<Container>, RouteError> {
        match self.containers.get(container_id) {
            Some(entry) if entry.is_routable() => Ok(Arc::clone(entry.value())),
            _ => Err(RouteError::NotFound),
        }
    }

    /// Resolve a container from a hostname whose first DNS label is the
    /// container id ("abc123.compute.example.com" -> "abc123").
    pub fn resolve_by_hostname(&self, hostname: &str) -> Result<Arc<Container>, RouteError> {
        let container_id = extract_container_id(hostname).ok_or(RouteError::NotFound)?;
        self.resolve(container_id)
    }

    /// As `resolve`, additionally requiring SSH access to be enabled.
    pub fn resolve_ssh(&self, container_id: &str) -> Result<Arc<Container>, RouteError> {
        let container = self.resolve(container_id)?;
        if !container.ssh_enabled {
            return Err(RouteError::ProtocolBlocked);
        }
        Ok(container)
    }

    /// Resolve a container and the target port mapped to `ingress_port`.
    pub fn resolve_http(
        &self,
        hostname: &str,
        ingress_port: u16,
    ) -> Result<(Arc<Container>, u16), RouteError> {
        let container = self.resolve_by_hostname(hostname)?;
        let target_port = *container
            .port_map
            .get(&ingress_port)
            .ok_or(RouteError::ProtocolBlocked)?;
        Ok((container, target_port))
    }

    /// Find a static route for `(host, path)` and compute the path the
    /// backend should see. With `strip_prefix` set (and a non-"/"
    /// prefix) the matched prefix is removed, an empty result becoming
    /// "/"; otherwise the path is passed through untouched.
    pub fn resolve_static_route(
        &self,
        host: &str,
        path: &str,
    ) -> Result<(Arc<StaticRoute>, String), RouteError> {
        let table = self.table.read().unwrap();
        let (route, remaining) = table.lookup(host, path);
        let Some(route) = route else {
            return Err(RouteError::NoRoute);
        };

        let target_path = if route.strip_prefix && route.path_prefix != "/" {
            remaining
        } else {
            path.to_string()
        };

        Ok((route, target_path))
    }

    /// All configured static routes, sorted by host then prefix.
    #[must_use]
    pub fn list_routes(&self) -> Vec<StaticRoute> {
        let mut routes = self.routes.read().unwrap().clone();
        routes.sort_by(|a, b| {
            a.host
                .cmp(&b.host)
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });
        routes
    }

    /// Union of the ingress ports of every cached container, sorted.
    #[must_use]
    pub fn all_ingress_ports(&self) -> Vec<u16> {
        let mut ports = BTreeSet::new();
        for entry in self.containers.iter() {
            ports.extend(entry.port_map.keys().copied());
        }
        ports.into_iter().collect()
    }

    /// Replace the container cache with a fresh snapshot: entries absent
    /// from `snapshot` are deleted, everything else is stored. Readers
    /// see a consistent per-entry view throughout.
    pub fn apply_container_snapshot(&self, snapshot: HashMap<String, Container>) {
        self.containers
            .retain(|id, _| snapshot.contains_key(id.as_str()));
        let count = snapshot.len();
        for (id, container) in snapshot {
            self.containers.insert(id, Arc::new(container));
        }
        debug!("loaded {} containers into cache", count);
    }

    /// Drop a single container from the cache ahead of the next refresh.
    pub fn invalidate_container(&self, container_id: &str) {
        self.containers.remove(container_id);
    }

    /// Swap in a freshly built static route set.
    pub fn replace_routes(&self, routes: Vec<StaticRoute>) {
        let mut table = RouteTable::new();
        for route in &routes {
            table.insert(route.clone());
        }
        *self.table.write().unwrap() = table;
        *self.routes.write().unwrap() = routes;
    }
}

/// Extract the container id from a hostname. Hostnames need at least
/// three labels; "abc123.compute.example.com" yields "abc123" while
/// "example.com" yields nothing.
fn extract_container_id(hostname: &str) -> Option<&str> {
    let dots = hostname.bytes().filter(|&b| b == b'.').count();
    if dots < 2 {
        return None;
    }
    let first = hostname.find('.')?;
    if first == 0 {
        return None;
    }
    Some(&hostname[..first])
}
