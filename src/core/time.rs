//! Timestamps, event ids and the JSON envelope every command prints.

use crate::core::error::LedgerError;
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// `intent:<op>:<ulid>`, attached to audit events of one mutation.
pub fn new_intent_ref(op: &str) -> String {
    format!("intent:{}:{}", op, Ulid::new())
}

/// Success envelope: `cmd`, `status = "ok"` and the payload's fields merged in.
pub fn command_envelope(cmd: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": "ok"
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

/// Error envelope. Only the public message leaves the process.
pub fn error_envelope(cmd: &str, err: &LedgerError) -> JsonValue {
    let kind = err.kind();
    serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": "error",
        "error": {
            "kind": kind.as_str(),
            "code": kind.status_code(),
            "message": err.public_message(),
        }
    })
}
