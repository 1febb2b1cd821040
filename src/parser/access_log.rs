use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::ext::{Extension, GeoIpProvider};
use crate::parser::Document;

/// Integer-coerced scalar fields.
const INT_FIELDS: &[&str] = &[
    "request_length",
    "connection_requests",
    "bytes_sent",
    "connection",
    "status",
    "body_bytes_sent",
];

/// Float-coerced scalar fields.
const FLOAT_FIELDS: &[&str] = &["request_time", "gzip_ratio"];

#[derive(Clone, Copy)]
enum ListCast {
    Keep,
    Int,
    Float,
}

/// Multi-upstream fields: nginx renders them as `a, b : c` where `,`
/// separates retries of one upstream and `:` separates upstreams.
const MULTI_FIELDS: &[(&str, ListCast)] = &[
    ("forwarded_for", ListCast::Keep),
    ("upstream_addr", ListCast::Keep),
    ("upstream_status", ListCast::Keep),
    ("upstream_response_time", ListCast::Float),
    ("upstream_response_length", ListCast::Int),
    ("upstream_connect_time", ListCast::Float),
];

/// Converts one JSON access-log line into a [`Document`], or `None` when the
/// line is not usable. Never blocks and never fails the pipeline: malformed
/// input is logged and dropped, malformed fields are left as they arrived.
pub struct AccessLogParser {
    hostname: String,
    geoip: Option<Arc<dyn GeoIpProvider>>,
    extensions: Vec<Arc<dyn Extension>>,
}

impl AccessLogParser {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            geoip: None,
            extensions: Vec::new(),
        }
    }

    pub fn with_geoip(mut self, geoip: Option<Arc<dyn GeoIpProvider>>) -> Self {
        self.geoip = geoip;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<Arc<dyn Extension>>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Parse one line read at `offset` in file instance `inode`.
    ///
    /// The position is folded into the deterministic `request_id` so that
    /// re-reading the same bytes after a restart produces identical document
    /// IDs and the sink deduplicates the replay.
    pub fn parse(&self, inode: u64, offset: u64, line: &str) -> Option<Document> {
        let trimmed = line.trim_end_matches(&['\n', '\r'][..]);
        if trimmed.is_empty() {
            return None;
        }

        let mut fields: Map<String, Value> = match serde_json::from_str(trimmed) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(line = trimmed, "dropping non-object line");
                return None;
            }
            Err(error) => {
                warn!(line = trimmed, %error, "dropping unparseable line");
                return None;
            }
        };

        let timestamp = match fields.remove("timestamp") {
            Some(Value::String(raw)) => match parse_timestamp(&raw) {
                Some(ts) => ts,
                None => {
                    warn!(timestamp = raw.as_str(), "dropping line with unparseable timestamp");
                    return None;
                }
            },
            _ => {
                warn!(line = trimmed, "dropping line without timestamp");
                return None;
            }
        };

        let mut doc = Document {
            timestamp,
            fields,
        };

        doc.insert("@hostname", self.hostname.clone());
        doc.insert(
            "request_id",
            format!(
                "{}-{}-{}-{}",
                self.hostname,
                inode,
                offset,
                timestamp.timestamp()
            ),
        );

        scrub_empty(&mut doc);
        split_request(&mut doc);
        split_request_uri(&mut doc);
        emit_path_components(&mut doc);
        coerce_scalars(&mut doc);
        normalize_multi_upstream(&mut doc);
        self.attach_geoip(&mut doc);

        for ext in &self.extensions {
            ext.apply(&mut doc);
        }

        Some(doc)
    }

    fn attach_geoip(&self, doc: &mut Document) {
        let Some(geoip) = &self.geoip else { return };
        let Some(addr) = doc.get_str("remote_addr").map(str::to_owned) else {
            return;
        };
        if let Some(record) = geoip.lookup(&addr) {
            let mut point = Map::new();
            point.insert("lat".to_string(), json_f64(record.lat));
            point.insert("lon".to_string(), json_f64(record.lon));
            doc.insert("geoip", Value::Object(point));
            if let Some(city) = record.city {
                doc.insert("city", city);
            }
            if let Some(region) = record.region_name {
                doc.insert("region_name", region);
            }
        }
    }
}

/// ISO-like timestamps with timezone. RFC 3339 first, then the same shape
/// with a colonless offset as nginx sometimes renders it.
fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
}

/// Drop every field whose value is `"-"` or the empty string, nginx's two
/// spellings of "not set".
fn scrub_empty(doc: &mut Document) {
    doc.fields
        .retain(|_, value| !matches!(value.as_str(), Some("-") | Some("")));
}

/// `request` is `<verb> <uri> <protocol>`; promote the URI and protocol when
/// it splits cleanly, otherwise leave the field alone.
fn split_request(doc: &mut Document) {
    let Some(request) = doc.get_str("request") else {
        return;
    };
    let tokens: Vec<&str> = request.split(' ').collect();
    if let [_, uri, protocol] = &tokens[..] {
        let uri = uri.to_string();
        let protocol = protocol.to_string();
        doc.remove("request");
        doc.insert("request_uri", uri);
        doc.insert("server_protocol", protocol);
    }
}

/// Split `request_uri` on the first `?` into `request_path` and
/// `request_qs`, decode the query string into `query` (name to list of
/// values, dots in names replaced so dynamic mapping accepts them), and
/// detect geo coordinates.
fn split_request_uri(doc: &mut Document) {
    let Some(uri) = doc.get_str("request_uri").map(str::to_owned) else {
        return;
    };

    let (path, qs) = match uri.split_once('?') {
        Some((path, qs)) => (path.to_string(), Some(qs.to_string())),
        None => (uri, None),
    };

    doc.insert("request_path", path);

    let Some(qs) = qs else { return };
    if qs.is_empty() {
        return;
    }
    doc.insert("request_qs", qs.clone());

    let mut query: Map<String, Value> = Map::new();
    for (name, value) in form_urlencoded::parse(qs.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        let name = name.replace('.', "_");
        match query.entry(name).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(values) => values.push(Value::String(value.into_owned())),
            _ => unreachable!(),
        }
    }

    let lon_alias = if query.contains_key("lng") { "lng" } else { "lon" };
    let geo = match (first_query_f64(&query, "lat"), first_query_f64(&query, lon_alias)) {
        (Some(lat), Some(lon)) => {
            let mut point = Map::new();
            point.insert("lat".to_string(), json_f64(lat));
            point.insert("lon".to_string(), json_f64(lon));
            Some(Value::Object(point))
        }
        _ => None,
    };

    doc.insert("query", Value::Object(query));
    if let Some(geo) = geo {
        doc.insert("query_geo", geo);
    }
}

fn first_query_f64(query: &Map<String, Value>, key: &str) -> Option<f64> {
    query
        .get(key)
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
}

/// Emit non-empty `/`-separated components of `request_path` as
/// `request_path_<n>`, numbered by position; the empty leading component
/// keeps the numbering 1-based.
fn emit_path_components(doc: &mut Document) {
    let Some(path) = doc.get_str("request_path").map(str::to_owned) else {
        return;
    };
    for (n, component) in path.split('/').enumerate() {
        if !component.is_empty() {
            doc.insert(format!("request_path_{}", n), component.to_string());
        }
    }
}

/// Best-effort numeric coercion; values that do not parse stay as strings.
fn coerce_scalars(doc: &mut Document) {
    for key in INT_FIELDS {
        if let Some(raw) = doc.get_str(key).map(str::to_owned) {
            match raw.parse::<i64>() {
                Ok(n) => doc.insert(*key, n),
                Err(_) => debug!(field = *key, value = raw.as_str(), "integer coercion skipped"),
            }
        }
    }
    for key in FLOAT_FIELDS {
        if let Some(raw) = doc.get_str(key).map(str::to_owned) {
            match raw.parse::<f64>() {
                Ok(v) => doc.insert(*key, json_f64(v)),
                Err(_) => debug!(field = *key, value = raw.as_str(), "float coercion skipped"),
            }
        }
    }
}

/// Normalize the retry/next-upstream separators to one token, split, trim,
/// drop empty and `-` members, and cast numeric lists. A field with nothing
/// left is deleted.
fn normalize_multi_upstream(doc: &mut Document) {
    for (key, cast) in MULTI_FIELDS {
        let Some(raw) = doc.get_str(key).map(str::to_owned) else {
            continue;
        };
        let normalized = raw.replace(',', ":");
        let members: Vec<String> = normalized
            .split(':')
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "-")
            .map(str::to_owned)
            .collect();

        if members.is_empty() {
            doc.remove(key);
            continue;
        }

        let value = match cast {
            ListCast::Keep => Value::Array(members.into_iter().map(Value::String).collect()),
            ListCast::Int => Value::Array(
                members
                    .iter()
                    .filter_map(|m| m.parse::<i64>().ok())
                    .map(Value::from)
                    .collect(),
            ),
            ListCast::Float => Value::Array(
                members
                    .iter()
                    .filter_map(|m| m.parse::<f64>().ok())
                    .map(json_f64)
                    .collect(),
            ),
        };
        doc.insert(*key, value);
    }
}

fn json_f64(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}
