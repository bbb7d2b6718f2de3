//! JSON augmentation shared by the receiver and the control loop.
//!
//! Every message that crosses from a client into this process, or from the
//! control endpoint out to a client, passes through here to have its
//! `client_id` field attached or stripped according to the passthrough rules
//! in the wire format.

use crate::ids::{self, ClientId};
use serde_json::{Map, Value};

/// Augment a freshly parsed client message before handing it to a peer
/// process.
///
/// Non-passthrough clients get `client_id`, `address`, and `server` set
/// directly. Passthrough clients instead have their own nested `client_id`
/// remapped into a composite id and get only `server` set — no `address`,
/// since the physical peer address belongs to the passthrough aggregator,
/// not the sub-client.
pub fn augment_inbound(
    mut obj: Map<String, Value>,
    id: ClientId,
    passthrough: bool,
    peer_address: &str,
    server_index: usize,
) -> Result<Map<String, Value>, AugmentError> {
    if passthrough {
        let nested = obj
            .get("client_id")
            .and_then(Value::as_i64)
            .ok_or(AugmentError::MissingNestedClientId)?;
        obj.insert(
            "client_id".to_string(),
            Value::from(ids::composite(id, nested)),
        );
    } else {
        obj.insert("client_id".to_string(), Value::from(id));
        obj.insert("address".to_string(), Value::from(peer_address));
    }
    obj.insert("server".to_string(), Value::from(server_index as u64));
    Ok(obj)
}

#[derive(Debug, thiserror::Error)]
pub enum AugmentError {
    #[error("passthrough client message missing integer client_id")]
    MissingNestedClientId,
}

/// Serialize a JSON object to a single line with a trailing newline, ready
/// to hand to `send_proc` or queue as an outbound send job.
pub fn to_line(obj: &Map<String, Value>) -> String {
    let mut s = serde_json::to_string(obj).expect("Map<String, Value> always serializes");
    s.push('\n');
    s
}

/// Parse a control-send command's JSON body, extracting the destination
/// `client_id` and returning the object with that field removed (the id is
/// routing metadata, not part of the payload delivered to the client).
///
/// If `id` is a composite id, the message's `client_id` is restored to the
/// original sub-client id (the remote peer addressed by its own view of the
/// id, not this process's composite encoding) before the caller re-inserts
/// it, per the control table's "restore the lower 32 bits" rule.
pub fn extract_send_target(mut obj: Map<String, Value>) -> Option<(ClientId, Map<String, Value>)> {
    let id = obj.remove("client_id")?.as_i64()?;
    if ids::is_composite(id) {
        let (_, subclient_id) = ids::split(id);
        obj.insert("client_id".to_string(), Value::from(subclient_id));
    }
    Some((id, obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_augment_non_passthrough_sets_id_address_server() {
        let msg = obj(json!({"method": "mining.subscribe"}));
        let out = augment_inbound(msg, 42, false, "127.0.0.1:5000", 0).unwrap();
        assert_eq!(out["client_id"], json!(42));
        assert_eq!(out["address"], json!("127.0.0.1:5000"));
        assert_eq!(out["server"], json!(0));
    }

    #[test]
    fn test_augment_passthrough_composites_id_and_omits_address() {
        let msg = obj(json!({"client_id": 7, "method": "mining.notify"}));
        let out = augment_inbound(msg, 100, true, "10.0.0.1:1", 0).unwrap();
        assert_eq!(out["client_id"], json!((100i64 << 32) | 7));
        assert!(!out.contains_key("address"));
    }

    #[test]
    fn test_augment_passthrough_missing_nested_id_errors() {
        let msg = obj(json!({"method": "mining.notify"}));
        let err = augment_inbound(msg, 100, true, "10.0.0.1:1", 0).unwrap_err();
        assert!(matches!(err, AugmentError::MissingNestedClientId));
    }

    #[test]
    fn test_extract_send_target_simple_id() {
        let msg = obj(json!({"client_id": 42, "result": true}));
        let (id, rest) = extract_send_target(msg).unwrap();
        assert_eq!(id, 42);
        assert!(!rest.contains_key("client_id"));
    }

    #[test]
    fn test_extract_send_target_composite_id_restores_subclient() {
        let composite_id = (100i64 << 32) | 7;
        let msg = obj(json!({"client_id": composite_id, "x": 1}));
        let (id, rest) = extract_send_target(msg).unwrap();
        assert_eq!(id, composite_id);
        assert_eq!(rest["client_id"], json!(7));
    }

    #[test]
    fn test_to_line_appends_single_newline() {
        let msg = obj(json!({"result": true}));
        let line = to_line(&msg);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
