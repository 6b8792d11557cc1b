//! # Edge Gateway
//!
//! A layer-7 edge gateway that accepts SSH, HTTP and TLS connections on
//! many listening ports and routes each one to a per-tenant container, a
//! statically configured upstream, or a configured fallback.
//!
//! Routing decisions are driven entirely by protocol-visible
//! identifiers, extracted at or before the application handshake:
//!
//! - **SSH**: the username names the tenant container (and optionally
//!   the backend user); the gateway re-authenticates with its own key.
//! - **HTTP**: the `Host` header and request path pick a static route,
//!   a container, or the fallback.
//! - **TLS**: the SNI hostname routes the raw byte stream; with a
//!   loaded certificate, operator hostnames can be terminated in place.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> protocol detection (peek + replay) -> handler
//!     handler -> Router (container cache + radix route table) -> backend
//! ```
//!
//! The [`router::Router`] keeps an in-memory snapshot of tenant
//! containers and static routes, refreshed from PostgreSQL every five
//! seconds; request paths never touch the database.

pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod logging;
pub mod proxy;
pub mod router;
pub mod secrets;
pub mod splice;
pub mod stream;

pub use error::RouteError;
pub use identity::SshIdentity;
pub use proxy::tls::extract_sni;
pub use proxy::{detect_protocol, GatewayServer, ListenerKind, Protocol};
pub use router::{Container, RouteState, RouteTable, Router, StaticRoute};
pub use secrets::{FileSecretStore, SecretStore};
pub use splice::splice;
pub use stream::ReplayStream;
