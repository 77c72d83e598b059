//! IPLD to JSON normalization.
//!
//! Firehose record blocks are DAG-CBOR; jetstream delivers the same records
//! as JSON. We normalize everything to the JSON form so a single set of
//! record types and one stored representation serve both backends.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ipld_core::ipld::Ipld;

/// Convert an IPLD value to JSON.
///
/// CID links become `{"$link": "<cid>"}` and byte strings become
/// `{"$bytes": "<base64>"}`, matching the JSON representation used on the
/// wire by jetstream and the XRPC record endpoints.
pub fn ipld_to_json(ipld: Ipld) -> serde_json::Value {
    use serde_json::Value;

    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => match i64::try_from(i) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(b) => {
            serde_json::json!({ "$bytes": BASE64.encode(b) })
        }
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => {
            serde_json::json!({ "$link": cid.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipld_core::cid::Cid;
    use std::collections::BTreeMap;

    #[test]
    fn test_scalars() {
        assert_eq!(ipld_to_json(Ipld::Null), serde_json::Value::Null);
        assert_eq!(ipld_to_json(Ipld::Bool(true)), serde_json::json!(true));
        assert_eq!(ipld_to_json(Ipld::Integer(42)), serde_json::json!(42));
        assert_eq!(
            ipld_to_json(Ipld::String("hi".into())),
            serde_json::json!("hi")
        );
    }

    #[test]
    fn test_link_becomes_dollar_link() {
        let cid: Cid = "bafyreib2rxk3rybloqtpwxev6skqdgvlfp2ewvqkdmvfrb4fhqnjdqftsu"
            .parse()
            .unwrap();
        let v = ipld_to_json(Ipld::Link(cid));
        assert_eq!(
            v,
            serde_json::json!({"$link": "bafyreib2rxk3rybloqtpwxev6skqdgvlfp2ewvqkdmvfrb4fhqnjdqftsu"})
        );
    }

    #[test]
    fn test_bytes_become_base64() {
        let v = ipld_to_json(Ipld::Bytes(vec![1, 2, 3]));
        assert_eq!(v, serde_json::json!({"$bytes": "AQID"}));
    }

    #[test]
    fn test_nested_record_shape() {
        let cid: Cid = "bafyreib2rxk3rybloqtpwxev6skqdgvlfp2ewvqkdmvfrb4fhqnjdqftsu"
            .parse()
            .unwrap();
        let mut subject = BTreeMap::new();
        subject.insert("uri".to_string(), Ipld::String("at://x/y/z".into()));
        subject.insert("cid".to_string(), Ipld::Link(cid));
        let mut rec = BTreeMap::new();
        rec.insert("subject".to_string(), Ipld::Map(subject));
        rec.insert(
            "createdAt".to_string(),
            Ipld::String("2024-05-01T12:00:00Z".into()),
        );

        let v = ipld_to_json(Ipld::Map(rec));
        assert_eq!(v["subject"]["uri"], "at://x/y/z");
        assert!(v["subject"]["cid"]["$link"].is_string());
    }
}
