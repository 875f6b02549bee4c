//! ASCII key=value payload codec for znode data.
//!
//! Every payload the cluster writes into the coordination store is a flat set
//! of `key=value` pairs joined by the ASCII unit separator. Keys are plain
//! identifiers; values must not contain the delimiter. Numeric fields are
//! parsed strictly so a corrupted advertisement marks the node bad instead of
//! silently routing to port 0.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Pair delimiter inside a serialized payload.
const DELIM: char = '\u{1f}';

// Well-known payload keys.
pub const KEY_HOST: &str = "host";
pub const KEY_BA_PORT: &str = "ba_port";
pub const KEY_WORKER_PORT: &str = "worker_port";
pub const KEY_DATA_PORT: &str = "data_port";
pub const KEY_MASTER_PORT: &str = "master_port";
pub const KEY_MASTER_NAME: &str = "master_name";
pub const KEY_SERVICE_NAMES: &str = "service_names";
pub const KEY_SERVICE_STATE: &str = "service_state";
pub const KEY_REPLICA_ID: &str = "replica_id";
pub const KEY_NODE_STATE: &str = "node_state";
pub const KEY_NODE_BUSY_STATE: &str = "node_busy_state";
pub const KEY_REQ_TYPE: &str = "req_type";
pub const KEY_REQ_DATA: &str = "req_data";
pub const KEY_MASTER_SERVER_REAL_PATH: &str = "master_server_real_path";
pub const KEY_SELF_REG_PRIMARY_PATH: &str = "self_reg_primary_path";
pub const KEY_NEW_SHARDING_NODEIDS: &str = "new_sharding_nodeids";

/// The per-service collection-list key (`<service>collection`).
pub fn service_collection_key(service: &str) -> String {
    format!("{}collection", service)
}

/// A parsed key=value payload.
///
/// Keys are kept sorted so serialization is deterministic and payload
/// comparisons in the store are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPayload {
    entries: BTreeMap<String, String>,
}

impl KvPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a payload from raw znode bytes.
    ///
    /// Unknown or malformed pairs (no `=`) are skipped; the payload format is
    /// append-only across versions and readers must tolerate foreign keys.
    pub fn parse(data: &[u8]) -> Self {
        let mut entries = BTreeMap::new();
        if let Ok(text) = std::str::from_utf8(data) {
            for pair in text.split(DELIM) {
                if let Some((key, value)) = pair.split_once('=') {
                    if !key.is_empty() {
                        entries.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        Self { entries }
    }

    /// Serialize to znode bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(DELIM);
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out.into_bytes()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        debug_assert!(
            !value.contains(DELIM),
            "payload value must not contain the pair delimiter"
        );
        self.entries.insert(key.to_string(), value);
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Get a string value, empty when absent.
    pub fn get_str(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    /// Strict u32 parse; absent or non-numeric values are errors.
    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let raw = self.get(key).unwrap_or("");
        raw.trim().parse::<u32>().map_err(|_| Error::PayloadParse {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Strict port parse (u16, non-zero).
    pub fn get_port(&self, key: &str) -> Result<u16> {
        let raw = self.get(key).unwrap_or("");
        match raw.trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(Error::PayloadParse {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encode a shard id list as the comma-joined payload value.
pub fn encode_id_list(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a comma-joined id list, skipping empty elements.
///
/// A non-numeric element fails the whole decode: a half-parsed new-sharding
/// list would mis-route the busy-state advertisement.
pub fn decode_id_list(raw: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for item in raw.split(',') {
        if item.is_empty() {
            continue;
        }
        let id = item.trim().parse::<u32>().map_err(|_| Error::PayloadParse {
            key: KEY_NEW_SHARDING_NODEIDS.to_string(),
            value: raw.to_string(),
        })?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut payload = KvPayload::new();
        payload.set(KEY_HOST, "10.0.1.7");
        payload.set(KEY_WORKER_PORT, 18151u16);
        payload.set(KEY_SERVICE_STATE, "ReadyForRead");

        let parsed = KvPayload::parse(&payload.serialize());
        assert_eq!(parsed.get_str(KEY_HOST), "10.0.1.7");
        assert_eq!(parsed.get_port(KEY_WORKER_PORT).unwrap(), 18151);
        assert_eq!(parsed.get_str(KEY_SERVICE_STATE), "ReadyForRead");
    }

    #[test]
    fn strict_port_parse_rejects_garbage() {
        let mut payload = KvPayload::new();
        payload.set(KEY_WORKER_PORT, "eighteen-thousand");
        assert!(payload.get_port(KEY_WORKER_PORT).is_err());

        payload.set(KEY_WORKER_PORT, "0");
        assert!(payload.get_port(KEY_WORKER_PORT).is_err());

        payload.set(KEY_WORKER_PORT, "70000");
        assert!(payload.get_port(KEY_WORKER_PORT).is_err());
    }

    #[test]
    fn missing_key_is_parse_error_not_zero() {
        let payload = KvPayload::new();
        assert!(payload.get_u32(KEY_NODE_STATE).is_err());
    }

    #[test]
    fn foreign_pairs_are_tolerated() {
        let raw = "host=a\u{1f}some_future_key=zzz\u{1f}broken-pair";
        let parsed = KvPayload::parse(raw.as_bytes());
        assert_eq!(parsed.get_str(KEY_HOST), "a");
        assert_eq!(parsed.get_str("some_future_key"), "zzz");
        assert!(!parsed.has_key("broken-pair"));
    }

    #[test]
    fn id_list_round_trip() {
        assert_eq!(encode_id_list(&[4, 5, 6]), "4,5,6");
        assert_eq!(decode_id_list("4,5,6").unwrap(), vec![4, 5, 6]);
        assert_eq!(decode_id_list("").unwrap(), Vec::<u32>::new());
        assert_eq!(decode_id_list(",,7").unwrap(), vec![7]);
        assert!(decode_id_list("4,x").is_err());
    }
}
