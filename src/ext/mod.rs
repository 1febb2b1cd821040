//! Post-processing extensions and the geo-IP lookup seam.
//!
//! Extensions are resolved by name at startup; there is no runtime plugin
//! loading. Geo-IP is a provider trait so deployments can wire in a real
//! database reader without the parser knowing about it.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::parser::Document;

/// A named document post-processor, applied after all built-in parser
/// transformations.
pub trait Extension: Send + Sync {
    fn apply(&self, doc: &mut Document);
}

/// Result of a geo-IP database lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRecord {
    pub lat: f64,
    pub lon: f64,
    pub city: Option<String>,
    pub region_name: Option<String>,
}

/// Resolves a client address to a location. Lookups are best-effort; `None`
/// means the address is unknown to the database.
pub trait GeoIpProvider: Send + Sync {
    fn lookup(&self, addr: &str) -> Option<GeoRecord>;
}

/// Resolve a built-in extension by name.
pub fn resolve(name: &str) -> Option<Arc<dyn Extension>> {
    match name {
        "upstream-time-total" => Some(Arc::new(UpstreamTimeTotal)),
        _ => None,
    }
}

/// Open a geo-IP database.
///
/// No database reader is compiled into this build; the provider is supplied
/// by deployments through [`GeoIpProvider`]. An explicit `--geoip` therefore
/// runs without lookups.
pub fn open_geoip(path: &Path) -> Option<Arc<dyn GeoIpProvider>> {
    warn!(
        path = %path.display(),
        "no geo-ip database reader is available in this build, lookups disabled"
    );
    None
}

/// Sums the per-upstream response times into `upstream_response_time_total`,
/// so dashboards can chart total backend time without unrolling the list.
struct UpstreamTimeTotal;

impl Extension for UpstreamTimeTotal {
    fn apply(&self, doc: &mut Document) {
        let total: Option<f64> = doc
            .get("upstream_response_time")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).sum());
        if let Some(total) = total {
            doc.insert("upstream_response_time_total", json!(total));
        }
    }
}
