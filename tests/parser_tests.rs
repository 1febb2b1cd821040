//! End-to-end parser scenarios over realistic access-log lines.

use siphon::parser::AccessLogParser;

fn parser() -> AccessLogParser {
    AccessLogParser::new("web1")
}

#[test]
fn test_single_clean_line() {
    let line = concat!(
        r#"{"timestamp":"2023-01-02T03:04:05+00:00","#,
        r#""request":"GET /a/b?lat=10&lng=20 HTTP/1.1","#,
        r#""status":"200","bytes_sent":"5","request_time":"0.010","#,
        r#""remote_addr":"1.2.3.4"}"#,
    );
    let doc = parser().parse(42, 0, line).unwrap();

    assert_eq!(doc.get_str("request_path"), Some("/a/b"));
    assert_eq!(doc.get_str("request_path_1"), Some("a"));
    assert_eq!(doc.get_str("request_path_2"), Some("b"));
    assert_eq!(
        doc.get("query_geo"),
        Some(&serde_json::json!({"lat": 10.0, "lon": 20.0}))
    );
    assert_eq!(doc.get_i64("status"), Some(200));
    assert_eq!(doc.get_i64("bytes_sent"), Some(5));
    assert_eq!(doc.get_f64("request_time"), Some(0.010));
    assert_eq!(doc.get_str("server_protocol"), Some("HTTP/1.1"));
    assert_eq!(doc.get_str("remote_addr"), Some("1.2.3.4"));

    let id = doc.get_str("request_id").unwrap();
    assert!(id.ends_with("-1672628645"), "unexpected id {}", id);
    assert_eq!(id, "web1-42-0-1672628645");
}

#[test]
fn test_geo_alias_lon_equals_lng() {
    let with_lng = parser()
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T03:04:05+00:00","request":"GET /a?lat=10&lng=20 HTTP/1.1"}"#,
        )
        .unwrap();
    let with_lon = parser()
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T03:04:05+00:00","request":"GET /a?lat=10&lon=20 HTTP/1.1"}"#,
        )
        .unwrap();
    assert_eq!(with_lng.get("query_geo"), with_lon.get("query_geo"));
    assert!(with_lng.get("query_geo").is_some());
}

#[test]
fn test_multi_upstream_retry_and_next() {
    let doc = parser()
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T03:04:05+00:00","upstream_response_time":"0.10, 0.20 : 0.30"}"#,
        )
        .unwrap();
    assert_eq!(
        doc.get("upstream_response_time"),
        Some(&serde_json::json!([0.10, 0.20, 0.30]))
    );
}

#[test]
fn test_dash_sentinel_field_absent() {
    let doc = parser()
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T03:04:05+00:00","upstream_status":"-"}"#,
        )
        .unwrap();
    assert!(!doc.contains("upstream_status"));
}

#[test]
fn test_replay_yields_identical_ids() {
    let p = parser();
    let lines = [
        (0u64, r#"{"timestamp":"2023-01-02T03:04:05+00:00","status":"200"}"#),
        (57u64, r#"{"timestamp":"2023-01-02T03:04:06+00:00","status":"404"}"#),
    ];

    let first: Vec<String> = lines
        .iter()
        .map(|(off, l)| {
            p.parse(42, *off, l)
                .unwrap()
                .get_str("request_id")
                .unwrap()
                .to_string()
        })
        .collect();
    let second: Vec<String> = lines
        .iter()
        .map(|(off, l)| {
            p.parse(42, *off, l)
                .unwrap()
                .get_str("request_id")
                .unwrap()
                .to_string()
        })
        .collect();

    assert_eq!(first, second);
    assert_ne!(first[0], first[1]);
}

#[test]
fn test_serialize_reparse_round_trip() {
    let line = concat!(
        r#"{"timestamp":"2023-01-02T03:04:05+00:00","#,
        r#""request":"GET /a/b?x=1 HTTP/1.1","status":"200","#,
        r#""upstream_response_time":"0.10 : 0.30","bytes_sent":"5"}"#,
    );
    let doc = parser().parse(42, 0, line).unwrap();

    // the serialized document parses back to the same value
    let rendered = doc.to_value();
    let reparsed: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&rendered).unwrap()).unwrap();
    assert_eq!(rendered, reparsed);
    assert_eq!(reparsed["@timestamp"], serde_json::json!("2023-01-02T03:04:05+00:00"));
}

#[test]
fn test_reparse_is_idempotent_after_first_round() {
    // a document whose string fields were already promoted and coerced
    // comes out unchanged when its JSON form is parsed again
    let line = r#"{"timestamp":"2023-01-02T03:04:05+00:00","request_uri":"/a/b","status":"200"}"#;
    let p = parser();
    let once = p.parse(42, 0, line).unwrap();

    let mut rendered = once.to_value();
    let map = rendered.as_object_mut().unwrap();
    map.remove("@timestamp");
    let reconstructed = format!(
        r#"{{"timestamp":"2023-01-02T03:04:05+00:00",{}"#,
        &serde_json::to_string(&rendered).unwrap()[1..]
    );
    let twice = p.parse(42, 0, &reconstructed).unwrap();

    assert_eq!(once.get_str("request_path"), twice.get_str("request_path"));
    assert_eq!(once.get_i64("status"), twice.get_i64("status"));
    assert_eq!(once.get_str("request_path_1"), twice.get_str("request_path_1"));
    assert_eq!(once.get_str("request_id"), twice.get_str("request_id"));
}

#[test]
fn test_timezone_preserved() {
    let doc = parser()
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T06:04:05+03:00","status":"200"}"#,
        )
        .unwrap();
    // same instant as 03:04:05 UTC, original offset kept
    assert_eq!(doc.timestamp.timestamp(), 1672628645);
    assert_eq!(doc.timestamp.offset().local_minus_utc(), 3 * 3600);
}

#[test]
fn test_extension_applied_in_order() {
    let doc = AccessLogParser::new("web1")
        .with_extensions(vec![siphon::ext::resolve("upstream-time-total").unwrap()])
        .parse(
            1,
            0,
            r#"{"timestamp":"2023-01-02T03:04:05+00:00","upstream_response_time":"0.10 : 0.30"}"#,
        )
        .unwrap();
    let total = doc.get_f64("upstream_response_time_total").unwrap();
    assert!((total - 0.40).abs() < 1e-9);
}
