//! src/query/internal.rs
//!
//! Handles queries whose name is prefixed `_serf_`: these never reach a
//! user's event channel, they're intercepted and answered directly
//! (§4.7). Today that's ping (a liveness echo with no payload), the
//! name-conflict address lookup, and the keyring read-only listing;
//! write operations to the keyring arrive over the RPC channel, not as
//! gossiped queries, so they aren't handled here.

use crate::domain::Member;
use crate::wire::NodeKeyResponse;
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const PING_QUERY: &str = "_serf_ping";
pub const CONFLICT_QUERY: &str = "_serf_conflict";
pub const INSTALL_KEY_QUERY: &str = "_serf_install-key";
pub const USE_KEY_QUERY: &str = "_serf_use-key";
pub const REMOVE_KEY_QUERY: &str = "_serf_remove-key";
pub const LIST_KEYS_QUERY: &str = "_serf_list-keys";

/// Dispatches an internal query by name, returning the payload to ack/
/// respond with, or `None` if the query isn't one this node answers (the
/// caller should simply not respond).
///
/// `conflicting_member` is the caller's local view of the member named by
/// the query's payload, already looked up by the time `handle` runs (this
/// module has no registry access of its own) — used only by
/// `CONFLICT_QUERY`.
pub fn handle(
    name: &str,
    primary_key: &[u8],
    installed_keys: &[Vec<u8>],
    response_size_limit: usize,
    conflicting_member: Option<&Member>,
) -> Option<Vec<u8>> {
    match name {
        PING_QUERY => Some(Vec::new()),
        CONFLICT_QUERY => Some(
            conflicting_member
                .and_then(|m| bincode::serialize(m).ok())
                .unwrap_or_default(),
        ),
        LIST_KEYS_QUERY => Some(encode_key_listing(primary_key, installed_keys, response_size_limit)),
        _ => None,
    }
}

fn encode_key_listing(primary_key: &[u8], installed_keys: &[Vec<u8>], size_limit: usize) -> Vec<u8> {
    let mut keys: Vec<String> = installed_keys.iter().map(|k| STANDARD.encode(k)).collect();
    let primary = STANDARD.encode(primary_key);

    // Truncate conservatively: drop trailing keys until the encoded
    // response fits the RPC response size limit rather than fail the
    // whole query.
    loop {
        let response = NodeKeyResponse {
            result: true,
            message: String::new(),
            keys: keys.clone(),
            primary_key: primary.clone(),
        };
        match bincode::serialize(&response) {
            Ok(bytes) if bytes.len() <= size_limit => return bytes,
            Ok(_) if keys.is_empty() => {
                return bincode::serialize(&NodeKeyResponse {
                    result: false,
                    message: "response exceeds size limit".into(),
                    keys: Vec::new(),
                    primary_key: primary,
                })
                .unwrap_or_default();
            }
            _ => {
                keys.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_has_an_empty_payload() {
        let reply = handle(PING_QUERY, b"k", &[], 1024, None).unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn unknown_internal_query_is_not_handled() {
        assert!(handle("_serf_unknown", b"k", &[], 1024, None).is_none());
    }

    #[test]
    fn list_keys_includes_primary_and_installed() {
        let reply = handle(LIST_KEYS_QUERY, b"primary", &[b"secondary".to_vec()], 4096, None).unwrap();
        let decoded: NodeKeyResponse = bincode::deserialize(&reply).unwrap();
        assert!(decoded.result);
        assert_eq!(decoded.primary_key, STANDARD.encode(b"primary"));
        assert_eq!(decoded.keys, vec![STANDARD.encode(b"secondary")]);
    }

    #[test]
    fn list_keys_truncates_to_fit_the_response_size_limit() {
        let many_keys: Vec<Vec<u8>> = (0..50).map(|i| vec![i as u8; 32]).collect();
        let reply = handle(LIST_KEYS_QUERY, b"primary", &many_keys, 256, None).unwrap();
        assert!(reply.len() <= 256 || {
            let decoded: NodeKeyResponse = bincode::deserialize(&reply).unwrap();
            !decoded.result
        });
    }

    #[test]
    fn conflict_query_returns_the_known_member_record() {
        use std::net::{IpAddr, Ipv4Addr};
        let member = Member::new("n1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 7946);
        let reply = handle(CONFLICT_QUERY, b"k", &[], 1024, Some(&member)).unwrap();
        let decoded: Member = bincode::deserialize(&reply).unwrap();
        assert_eq!(decoded.name, "n1");
        assert_eq!(decoded.addr, member.addr);
    }

    #[test]
    fn conflict_query_returns_empty_for_an_unknown_name() {
        let reply = handle(CONFLICT_QUERY, b"k", &[], 1024, None).unwrap();
        assert!(reply.is_empty());
    }
}
