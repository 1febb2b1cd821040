use serde_json::{json, Value};

/// Index template applied on startup unless one already exists: keyword/long
/// dynamic mappings for the open-ended document fields, typed mappings for
/// the fields queries rely on, and geo-points for both coordinate sources.
pub fn default_template() -> Value {
    json!({
        "template": "nginx-*",
        "settings": {
            "index.refresh_interval": "10s",
            "index.unassigned.node_left.delayed_timeout": "5m"
        },
        "mappings": {
            "_default_": {
                "_all": {"enabled": false},
                "date_detection": false,
                "dynamic_templates": [
                    {
                        "string_fields": {
                            "match": "*",
                            "match_mapping_type": "string",
                            "mapping": {"type": "keyword", "norms": false}
                        }
                    },
                    {
                        "long_fields": {
                            "match": "*",
                            "match_mapping_type": "long",
                            "mapping": {"type": "long", "norms": false}
                        }
                    }
                ],
                "properties": {
                    "@timestamp": {"type": "date", "format": "dateOptionalTime"},
                    "remote_addr": {"type": "ip"},
                    "geoip": {"type": "geo_point"},
                    "query_geo": {"type": "geo_point"},
                    "request": {
                        "type": "text",
                        "fields": {
                            "raw": {"type": "keyword", "norms": false}
                        }
                    },
                    "request_path": {
                        "type": "text",
                        "fields": {
                            "raw": {"type": "keyword", "norms": false}
                        }
                    },
                    "request_qs": {
                        "type": "text",
                        "fields": {
                            "raw": {"type": "keyword", "norms": false}
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_mappings() {
        let t = default_template();
        assert_eq!(t["template"], json!("nginx-*"));
        let props = &t["mappings"]["_default_"]["properties"];
        assert_eq!(props["@timestamp"]["type"], json!("date"));
        assert_eq!(props["remote_addr"]["type"], json!("ip"));
        assert_eq!(props["geoip"]["type"], json!("geo_point"));
        assert_eq!(props["query_geo"]["type"], json!("geo_point"));
        assert_eq!(props["request_path"]["fields"]["raw"]["type"], json!("keyword"));
    }
}
