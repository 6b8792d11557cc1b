//! Container and static-route resolution backed by PostgreSQL
//!
//! The router keeps an in-memory picture of the world (see [`RouteState`])
//! and refreshes it from the database every five seconds. Database
//! failures never reach request paths: the last good snapshot stays in
//! place and the error is logged.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::constants::router::REFRESH_INTERVAL;
use crate::error::RouteError;

pub mod radix;
pub mod state;

pub use radix::RouteTable;
pub use state::RouteState;

/// Routing information for a tenant container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub namespace: String,
    pub external_ip: String,
    pub status: String,
    pub ssh_enabled: bool,
    pub https_enabled: bool,
    /// ingress port -> target port
    pub port_map: HashMap<u16, u16>,
}

impl Container {
    /// A container is routable when it is running and has an address.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.status == "running" && !self.external_ip.is_empty()
    }

    /// In-cluster address of the container's service for `target_port`
    #[must_use]
    pub fn backend_addr(&self, target_port: u16) -> String {
        format!("lb.{}.svc.cluster.local:{}", self.namespace, target_port)
    }

    /// In-cluster address of the container's sshd
    #[must_use]
    pub fn ssh_addr(&self) -> String {
        self.backend_addr(crate::constants::ports::BACKEND_SSH)
    }
}

/// An operator-configured `(host, path_prefix) -> target` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub id: i32,
    pub host: String,
    /// e.g. "/compute" or "/"
    pub path_prefix: String,
    /// Literal "host:port" upstream
    pub target: String,
    /// Whether to strip the matched prefix from the forwarded path
    pub strip_prefix: bool,
    /// Derived on registration, reporting only; lookup uses
    /// longest-prefix semantics directly
    pub priority: i32,
}

/// Priority assigned to a route at registration time. Longer prefixes
/// report higher, the "/" catch-all is pinned to the bottom.
#[must_use]
pub fn route_priority(path_prefix: &str) -> i32 {
    if path_prefix == "/" {
        0
    } else {
        path_prefix.len() as i32 * 10
    }
}

/// Resolves container ids and static routes, with a periodic database sync.
pub struct Router {
    pool: PgPool,
    state: Arc<RouteState>,
    shutdown: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Connect to the database, ensure the static_routes table exists,
    /// perform the initial load and start the background sync loop.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("open database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS static_routes (
                id SERIAL PRIMARY KEY,
                host TEXT NOT NULL,
                path_prefix TEXT NOT NULL,
                target TEXT NOT NULL,
                strip_prefix BOOLEAN NOT NULL DEFAULT false,
                priority INT NOT NULL DEFAULT 0,
                UNIQUE(host, path_prefix)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("create static_routes table")?;

        let router = Self {
            pool,
            state: Arc::new(RouteState::new()),
            shutdown: CancellationToken::new(),
            sync_task: Mutex::new(None),
        };

        router.load_all().await.context("initial load")?;
        router.spawn_sync_loop().await;

        Ok(router)
    }

    /// Shared resolution state, handed to the proxy server.
    #[must_use]
    pub fn state(&self) -> Arc<RouteState> {
        self.state.clone()
    }

    pub fn resolve(&self, container_id: &str) -> Result<Arc<Container>, RouteError> {
        self.state.resolve(container_id)
    }

    pub fn resolve_ssh(&self, container_id: &str) -> Result<Arc<Container>, RouteError> {
        self.state.resolve_ssh(container_id)
    }

    pub fn resolve_http(
        &self,
        hostname: &str,
        ingress_port: u16,
    ) -> Result<(Arc<Container>, u16), RouteError> {
        self.state.resolve_http(hostname, ingress_port)
    }

    pub fn resolve_static_route(
        &self,
        host: &str,
        path: &str,
    ) -> Result<(Arc<StaticRoute>, String), RouteError> {
        self.state.resolve_static_route(host, path)
    }

    #[must_use]
    pub fn list_routes(&self) -> Vec<StaticRoute> {
        self.state.list_routes()
    }

    #[must_use]
    pub fn all_ingress_ports(&self) -> Vec<u16> {
        self.state.all_ingress_ports()
    }

    /// Add or update a static route and reload the route table.
    pub async fn register_route(
        &self,
        host: &str,
        path_prefix: &str,
        target: &str,
        strip_prefix: bool,
    ) -> Result<()> {
        let priority = route_priority(path_prefix);

        sqlx::query(
            r#"
            INSERT INTO static_routes (host, path_prefix, target, strip_prefix, priority)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (host, path_prefix) DO UPDATE SET
                target = EXCLUDED.target,
                strip_prefix = EXCLUDED.strip_prefix,
                priority = EXCLUDED.priority
            "#,
        )
        .bind(host)
        .bind(path_prefix)
        .bind(target)
        .bind(strip_prefix)
        .bind(priority)
        .execute(&self.pool)
        .await
        .context("insert static route")?;

        self.load_static_routes().await
    }

    /// Remove a static route; `RouteError::NoRoute` when nothing matched.
    pub async fn unregister_route(&self, host: &str, path_prefix: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM static_routes WHERE host = $1 AND path_prefix = $2")
            .bind(host)
            .bind(path_prefix)
            .execute(&self.pool)
            .await
            .context("delete static route")?;

        if result.rows_affected() == 0 {
            return Err(RouteError::NoRoute.into());
        }

        self.load_static_routes().await
    }

    /// Stop the sync loop and close the database pool.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.sync_task.lock().await.take() {
            let _ = task.await;
        }
        self.pool.close().await;
    }

    async fn spawn_sync_loop(&self) {
        let pool = self.pool.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and would duplicate the
            // initial load
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = load_all(&pool, &state).await {
                            error!("failed to sync cache: {:#}", e);
                        }
                    }
                }
            }
        });

        *self.sync_task.lock().await = Some(task);
    }

    async fn load_all(&self) -> Result<()> {
        load_all(&self.pool, &self.state).await
    }

    async fn load_static_routes(&self) -> Result<()> {
        let routes = query_static_routes(&self.pool).await?;
        info!("reloaded static routes, count={}", routes.len());
        self.state.replace_routes(routes);
        Ok(())
    }
}

/// Rebuild the container snapshot and the static route table from the
/// database, then swap both into the shared state.
async fn load_all(pool: &PgPool, state: &RouteState) -> Result<()> {
    let container_rows = sqlx::query(
        r#"
        SELECT id, namespace, external_ip, status,
               COALESCE(ssh_enabled, false) AS ssh_enabled,
               COALESCE(https_enabled, false) AS https_enabled
        FROM containers
        WHERE status = 'running' AND external_ip IS NOT NULL AND external_ip <> ''
        "#,
    )
    .fetch_all(pool)
    .await
    .context("query containers")?;

    let mut snapshot = HashMap::with_capacity(container_rows.len());
    for row in container_rows {
        let external_ip: Option<String> = row.try_get("external_ip").context("scan container")?;
        let Some(external_ip) = external_ip.filter(|ip| !ip.is_empty()) else {
            continue;
        };
        let container = Container {
            id: row.try_get("id").context("scan container")?,
            namespace: row.try_get("namespace").context("scan container")?,
            external_ip,
            status: row.try_get("status").context("scan container")?,
            ssh_enabled: row.try_get("ssh_enabled").context("scan container")?,
            https_enabled: row.try_get("https_enabled").context("scan container")?,
            port_map: HashMap::new(),
        };
        snapshot.insert(container.id.clone(), container);
    }

    let rule_rows = sqlx::query("SELECT container_id, port, target_port FROM ingress_rules")
        .fetch_all(pool)
        .await
        .context("query ingress rules")?;

    for row in rule_rows {
        let container_id: String = row.try_get("container_id").context("scan ingress rule")?;
        let port: i32 = row.try_get("port").context("scan ingress rule")?;
        let target_port: i32 = row.try_get("target_port").context("scan ingress rule")?;
        if let Some(container) = snapshot.get_mut(&container_id) {
            container.port_map.insert(port as u16, target_port as u16);
        }
    }

    state.apply_container_snapshot(snapshot);

    let routes = query_static_routes(pool).await?;
    for route in &routes {
        debug!(
            "loaded route host={} path={} target={} strip_prefix={}",
            route.host, route.path_prefix, route.target, route.strip_prefix
        );
    }
    debug!("loaded {} static routes into cache", routes.len());
    state.replace_routes(routes);

    Ok(())
}

async fn query_static_routes(pool: &PgPool) -> Result<Vec<StaticRoute>> {
    let rows = sqlx::query(
        "SELECT id, host, path_prefix, target, strip_prefix, priority FROM static_routes",
    )
    .fetch_all(pool)
    .await
    .context("query static routes")?;

    let mut routes = Vec::with_capacity(rows.len());
    for row in rows {
        routes.push(StaticRoute {
            id: row.try_get("id").context("scan static route")?,
            host: row.try_get("host").context("scan static route")?,
            path_prefix: row.try_get("path_prefix").context("scan static route")?,
            target: row.try_get("target").context("scan static route")?,
            strip_prefix: row.try_get("strip_prefix").context("scan static route")?,
            priority: row.try_get("priority").context("scan static route")?,
        });
    }
    Ok(routes)
}
