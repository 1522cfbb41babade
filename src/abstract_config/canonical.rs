use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::error::Result;

/// Drop nulls, empty strings, empty arrays and empty objects, bottom-up
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(prune).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Object(map) => {
            let map: serde_json::Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other),
    }
}

/// Compact JSON with object keys in byte order at every level
fn write_sorted(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_sorted(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_sorted(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

fn canonical_from_value(value: Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match prune(value) {
        Some(v) => write_sorted(&v, &mut out)?,
        None => out.extend_from_slice(b"{}"),
    }
    Ok(out)
}

/// Canonical UTF-8 bytes of a serializable document
pub fn canonical_bytes<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    canonical_from_value(serde_json::to_value(doc)?)
}

/// Canonical bytes of an already-serialized JSON document
pub fn canonical_bytes_from_str(json: &str) -> Result<Vec<u8>> {
    canonical_from_value(serde_json::from_str(json)?)
}

/// Lowercase hex SHA-256
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

/// Content fingerprint of a document
pub fn fingerprint<T: Serialize>(doc: &T) -> Result<String> {
    Ok(fingerprint_bytes(&canonical_bytes(doc)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_config::{BgpGroup, Device, LinkAggregation, System, Vlan};
    use std::collections::BTreeSet;

    #[test]
    fn test_key_order_and_whitespace_do_not_matter() {
        let a = r#"{"system": {"name": "leaf1", "uuid": "u1"}, "bgp": []}"#;
        let b = "{\n  \"system\":{\"uuid\":\"u1\",\n\"name\":\"leaf1\"}\n}";
        let ca = canonical_bytes_from_str(a).unwrap();
        let cb = canonical_bytes_from_str(b).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(String::from_utf8(ca).unwrap(), r#"{"system":{"name":"leaf1","uuid":"u1"}}"#);
        assert_eq!(fingerprint_bytes(&cb).len(), 64);
    }

    #[test]
    fn test_empty_fields_elided() {
        let v = serde_json::json!({"a": null, "b": "", "c": [], "d": {"e": []}, "f": 0, "g": false});
        let bytes = canonical_from_value(v).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"f":0,"g":false}"#);
    }

    #[test]
    fn test_zero_numbers_leave_the_fingerprint_alone() {
        let lag = LinkAggregation { lacp_mode: "active".into(), ..Default::default() };
        let text = String::from_utf8(canonical_bytes(&lag).unwrap()).unwrap();
        assert_eq!(text, r#"{"lacp_mode":"active"}"#);
        assert_eq!(fingerprint(&lag).unwrap(), fingerprint_bytes(text.as_bytes()));

        let group = BgpGroup { name: "g".into(), ..Default::default() };
        let text = String::from_utf8(canonical_bytes(&group).unwrap()).unwrap();
        assert!(!text.contains("autonomous_system"), "{}", text);

        let vlan = Vlan { name: "bd-1".into(), ..Default::default() };
        let text = String::from_utf8(canonical_bytes(&vlan).unwrap()).unwrap();
        assert_eq!(text, r#"{"name":"bd-1"}"#);

        let set = Vlan { name: "bd-1".into(), vxlan_id: 5001, ..Default::default() };
        assert_ne!(fingerprint(&vlan).unwrap(), fingerprint(&set).unwrap());
    }

    #[test]
    fn test_loopback_order_is_irrelevant() {
        let mut first = System::default();
        first.name = "leaf1".into();
        first.loopback_ip_list = ["10.0.0.2", "10.0.0.1"].iter().map(|s| s.to_string()).collect();
        let mut second = System::default();
        second.name = "leaf1".into();
        second.loopback_ip_list = ["10.0.0.1", "10.0.0.2", "10.0.0.1"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>();

        let a = Device { system: Some(first), ..Default::default() };
        let b = Device { system: Some(second), ..Default::default() };
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_different_content_different_fingerprint() {
        let mut device = Device::default();
        let empty = fingerprint(&device).unwrap();
        device.system = Some(System { name: "spine1".into(), ..Default::default() });
        assert_ne!(empty, fingerprint(&device).unwrap());
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint_bytes(b"{}"),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }
}
