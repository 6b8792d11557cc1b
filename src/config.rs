//! Configuration loading
//!
//! Most of the gateway is configured through command-line flags; this
//! module holds the pieces that come from files and the parsers the
//! flag definitions use.

use std::ops::RangeInclusive;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One static route in the routes file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteEntry {
    pub host: String,
    pub path: String,
    pub target: String,
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Contents of the optional static-routes file (TOML)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

/// Load the static-routes file. A missing file is not an error; the
/// gateway simply starts without file-provisioned routes.
pub fn load_routes_file(path: &str) -> Result<Option<RoutesFile>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::anyhow!("failed to read routes file '{}': {}", path, e));
        }
    };

    let file: RoutesFile = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse routes file '{}': {}", path, e))?;
    Ok(Some(file))
}

/// Parse an inclusive port range like "8000-8999" (a single port is
/// also accepted).
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (lo, hi),
        None => (s, s),
    };
    let lo: u16 = lo
        .trim()
        .parse()
        .map_err(|e| format!("invalid port '{}': {}", lo, e))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .map_err(|e| format!("invalid port '{}': {}", hi, e))?;
    if lo > hi {
        return Err(format!("invalid port range '{}': start exceeds end", s));
    }
    Ok(lo..=hi)
}
