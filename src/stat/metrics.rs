//! Per-bucket metric computation: projection rows, histogram bin labels,
//! tuple-keyed groupby accumulators, and exact quantiles.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde_json::Value;

use crate::parser::Document;

pub const QUANTILES: &[f64] = &[0.50, 0.75, 0.90, 0.99];

/// The projection of one record kept per bucket. Everything the metric set
/// needs and nothing else, so buckets stay small.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatRow {
    pub status: i64,
    pub host: Option<String>,
    pub request_path_1: Option<String>,
    pub request_path_2: Option<String>,
    pub upstream_cache_status: Option<String>,
    pub request_time: Option<f64>,
    pub upstream_response_time: Option<Vec<f64>>,
    pub bytes_sent: Option<i64>,
}

/// Project a document onto the stat dimensions. `None` when the record has
/// no numeric status to group on.
pub fn project(doc: &Document) -> Option<StatRow> {
    let status = doc.get_i64("status")?;
    let upstream = doc.get("upstream_response_time").and_then(|v| match v {
        Value::Array(items) => Some(items.iter().filter_map(Value::as_f64).collect()),
        Value::Number(n) => n.as_f64().map(|x| vec![x]),
        _ => None,
    });
    Some(StatRow {
        status,
        host: doc.get_str("host").map(str::to_owned),
        request_path_1: doc.get_str("request_path_1").map(str::to_owned),
        request_path_2: doc.get_str("request_path_2").map(str::to_owned),
        upstream_cache_status: doc.get_str("upstream_cache_status").map(str::to_owned),
        request_time: doc.get_f64("request_time"),
        upstream_response_time: upstream,
        bytes_sent: doc.get_i64("bytes_sent"),
    })
}

/// A metric value with its line-protocol rendering: floats with three
/// decimals, integers plain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

/// Histogram bin label for a duration value.
///
/// The exponent is `round(10 * log10(v))`; zero, negative and NaN values get
/// the -31 sentinel exponent. The label is the integer truncation of
/// `1000 * 10^(e/10)`, which keeps the sentinel bin ("0") distinct from the
/// 0.001 bin ("1").
pub fn log10_bin(v: Option<f64>) -> String {
    let exponent = match v {
        Some(x) if x > 0.0 && x.is_finite() => (10.0 * x.log10()).round() as i32,
        _ => -31,
    };
    let label = (1000.0 * 10f64.powf(f64::from(exponent) / 10.0)) as i64;
    format!("{}", label)
}

/// Linear-interpolation quantile over an already sorted, non-empty slice.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Build the dotted metric name: prefix components, then parts, with dots
/// inside any part replaced so they cannot split the name.
pub fn metric_name<S: AsRef<str>>(prefix: &str, parts: &[S]) -> String {
    prefix
        .split('.')
        .map(str::to_owned)
        .chain(parts.iter().map(|p| p.as_ref().replace('.', "_")))
        .collect::<Vec<_>>()
        .join(".")
}

struct Prepared {
    host: String,
    p1: String,
    p2: String,
    status: i64,
    cache: String,
    request_time: Option<f64>,
    upstream_time: Option<f64>,
    bytes_sent: Option<i64>,
    rt_bin: String,
    ut_bin: String,
}

/// Frame preparation: fill missing path components with `#`, collapse UUID
/// path components, default the cache status, and keep only the last
/// upstream's response time (the upstream that actually answered).
fn prepare(rows: &[StatRow], uuid: &Regex) -> Vec<Prepared> {
    rows.iter()
        .filter_map(|row| {
            // grouping is per host everywhere; a record without one has no
            // group to land in
            let host = row.host.clone()?;
            let p1 = scrub_uuid(row.request_path_1.as_deref().unwrap_or("#"), uuid);
            let p2 = scrub_uuid(row.request_path_2.as_deref().unwrap_or("#"), uuid);
            let cache = row
                .upstream_cache_status
                .clone()
                .unwrap_or_else(|| "NONE".to_string());
            let upstream_time = row
                .upstream_response_time
                .as_ref()
                .and_then(|times| times.last().copied());
            Some(Prepared {
                host,
                p1,
                p2,
                status: row.status,
                cache,
                request_time: row.request_time,
                upstream_time,
                bytes_sent: row.bytes_sent,
                rt_bin: log10_bin(row.request_time),
                ut_bin: log10_bin(upstream_time),
            })
        })
        .collect()
}

fn scrub_uuid(value: &str, uuid: &Regex) -> String {
    if uuid.is_match(value) {
        "<uuid>".to_string()
    } else {
        value.to_string()
    }
}

/// Compute the full metric set for one bucket.
pub fn compute(prefix: &str, rows: &[StatRow], uuid: &Regex) -> Vec<(String, MetricValue)> {
    let prepared = prepare(rows, uuid);
    let mut out = Vec::new();
    if prepared.is_empty() {
        return out;
    }

    // request_time sum/count per (host, p1, p2, status, cache, bin)
    let mut rt: BTreeMap<(String, String, String, i64, String, String), (f64, i64)> =
        BTreeMap::new();
    for p in &prepared {
        let key = (
            p.host.clone(),
            p.p1.clone(),
            p.p2.clone(),
            p.status,
            p.cache.clone(),
            p.rt_bin.clone(),
        );
        let acc = rt.entry(key).or_insert((0.0, 0));
        if let Some(v) = p.request_time {
            acc.0 += v;
            acc.1 += 1;
        }
    }
    for (key, (sum, _)) in &rt {
        let (host, p1, p2, status, cache, bin) = key;
        let status = status.to_string();
        let parts = [
            "request_time",
            "sum",
            host.as_str(),
            p1.as_str(),
            p2.as_str(),
            status.as_str(),
            cache.as_str(),
            bin.as_str(),
        ];
        out.push((metric_name(prefix, &parts), MetricValue::Float(*sum)));
    }
    for (key, (_, count)) in &rt {
        let (host, p1, p2, status, cache, bin) = key;
        let status = status.to_string();
        let parts = [
            "request_time",
            "count",
            host.as_str(),
            p1.as_str(),
            p2.as_str(),
            status.as_str(),
            cache.as_str(),
            bin.as_str(),
        ];
        out.push((metric_name(prefix, &parts), MetricValue::Int(*count)));
    }

    // upstream_response_time sum/count per (host, p1, p2, status, bin),
    // over records that actually hit an upstream
    let mut ut: BTreeMap<(String, String, String, i64, String), (f64, i64)> = BTreeMap::new();
    for p in &prepared {
        let Some(v) = p.upstream_time else { continue };
        let key = (
            p.host.clone(),
            p.p1.clone(),
            p.p2.clone(),
            p.status,
            p.ut_bin.clone(),
        );
        let acc = ut.entry(key).or_insert((0.0, 0));
        acc.0 += v;
        acc.1 += 1;
    }
    for (key, (sum, _)) in &ut {
        let (host, p1, p2, status, bin) = key;
        let status = status.to_string();
        let parts = [
            "upstream_response_time",
            "sum",
            host.as_str(),
            p1.as_str(),
            p2.as_str(),
            status.as_str(),
            bin.as_str(),
        ];
        out.push((metric_name(prefix, &parts), MetricValue::Float(*sum)));
    }
    for (key, (_, count)) in &ut {
        let (host, p1, p2, status, bin) = key;
        let status = status.to_string();
        let parts = [
            "upstream_response_time",
            "count",
            host.as_str(),
            p1.as_str(),
            p2.as_str(),
            status.as_str(),
            bin.as_str(),
        ];
        out.push((metric_name(prefix, &parts), MetricValue::Int(*count)));
    }

    // bytes_sent per (host, p1, p2, status)
    let mut bytes: BTreeMap<(String, String, String, i64), i64> = BTreeMap::new();
    for p in &prepared {
        let key = (p.host.clone(), p.p1.clone(), p.p2.clone(), p.status);
        let acc = bytes.entry(key).or_insert(0);
        if let Some(v) = p.bytes_sent {
            *acc += v;
        }
    }
    for (key, sum) in &bytes {
        let (host, p1, p2, status) = key;
        let status = status.to_string();
        let parts = [
            "bytes_sent",
            host.as_str(),
            p1.as_str(),
            p2.as_str(),
            status.as_str(),
        ];
        out.push((metric_name(prefix, &parts), MetricValue::Int(*sum)));
    }

    // exact percentiles only per host: deeper drill-downs cannot be
    // re-aggregated and belong to the histogram bins above
    let mut rt_by_host: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut ut_by_host: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for p in &prepared {
        if let Some(v) = p.request_time {
            rt_by_host.entry(p.host.clone()).or_default().push(v);
        }
        if let Some(v) = p.upstream_time {
            ut_by_host.entry(p.host.clone()).or_default().push(v);
        }
    }
    for (host, mut values) in rt_by_host {
        values.sort_by(|a, b| a.total_cmp(b));
        for q in QUANTILES {
            let label = format!("p{}", (q * 100.0) as i64);
            let parts = ["request_time", "percentiles", host.as_str(), label.as_str()];
            out.push((
                metric_name(prefix, &parts),
                MetricValue::Float(quantile(&values, *q)),
            ));
        }
    }
    for (host, mut values) in ut_by_host {
        values.sort_by(|a, b| a.total_cmp(b));
        for q in QUANTILES {
            let label = format!("p{}", (q * 100.0) as i64);
            let parts = [
                "upstream_response_time",
                "percentiles",
                host.as_str(),
                label.as_str(),
            ];
            out.push((
                metric_name(prefix, &parts),
                MetricValue::Float(quantile(&values, *q)),
            ));
        }
    }

    out
}
