//! src/tags.rs
//!
//! Encodes and decodes a node's key/value tag map into the gossip layer's
//! opaque node-meta bytes. Protocol versions below 3 only ever carried a
//! single `"role"` string; newer nodes prefix the bincode-encoded map with a
//! magic byte so old and new nodes can still exchange a best-effort view of
//! each other's tags during a mixed-version rollout.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Marks a `NodeMeta` payload as a bincode-encoded tag map rather than a
/// legacy raw "role" string. Chosen because it is not valid as the first
/// byte of any UTF-8 string produced by a legacy node.
pub const TAG_MAGIC_BYTE: u8 = 0xFF;

/// The delegate protocol version at which full tag maps were introduced.
/// Below this, only the single `"role"` tag is carried.
pub const TAGS_PROTOCOL_MIN: u8 = 3;

pub type Tags = BTreeMap<String, String>;

/// Encodes `tags` for a peer speaking delegate protocol `protocol_version`.
pub fn encode_tags(tags: &Tags, protocol_version: u8) -> Result<Vec<u8>> {
    if protocol_version < TAGS_PROTOCOL_MIN {
        let role = tags.get("role").cloned().unwrap_or_default();
        return Ok(role.into_bytes());
    }

    let body = bincode::serialize(tags)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(TAG_MAGIC_BYTE);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a `NodeMeta` payload back into a tag map. Raw non-magic bytes are
/// interpreted as the legacy single `"role"` string.
pub fn decode_tags(raw: &[u8]) -> Result<Tags> {
    if raw.is_empty() {
        return Ok(Tags::new());
    }

    if raw[0] == TAG_MAGIC_BYTE {
        let tags: Tags = bincode::deserialize(&raw[1..])?;
        return Ok(tags);
    }

    let role = String::from_utf8(raw.to_vec()).map_err(|e| Error::Decode(e.to_string()))?;
    let mut tags = Tags::new();
    if !role.is_empty() {
        tags.insert("role".to_string(), role);
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_modern_tags() {
        let mut tags = Tags::new();
        tags.insert("role".to_string(), "web".to_string());
        tags.insert("az".to_string(), "us-east-1a".to_string());

        let encoded = encode_tags(&tags, 3).unwrap();
        assert_eq!(encoded[0], TAG_MAGIC_BYTE);
        let decoded = decode_tags(&encoded).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn legacy_protocol_drops_to_role_only() {
        let mut tags = Tags::new();
        tags.insert("role".to_string(), "db".to_string());
        tags.insert("ignored".to_string(), "x".to_string());

        let encoded = encode_tags(&tags, 2).unwrap();
        assert_eq!(encoded, b"db");
        let decoded = decode_tags(&encoded).unwrap();
        assert_eq!(decoded.get("role"), Some(&"db".to_string()));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn decodes_raw_legacy_bytes_from_an_old_peer() {
        let decoded = decode_tags(b"cache").unwrap();
        let mut expected = Tags::new();
        expected.insert("role".to_string(), "cache".to_string());
        assert_eq!(decoded, expected);
    }

    #[test]
    fn empty_bytes_decode_to_empty_map() {
        assert_eq!(decode_tags(&[]).unwrap(), Tags::new());
    }
}
