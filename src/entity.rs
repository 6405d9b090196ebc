// entity.rs - Open-JSON entity type and the metadata the core inspects
//
// Entities are schema-agnostic: the core only ever looks at `_id` and
// `_kmd.local`. Everything else passes through untouched.

use rand::RngCore;
use serde_json::{Map, Value};

/// An entity is an open JSON object. We keep it as a `serde_json::Map` rather
/// than a typed struct so callers can round-trip arbitrary application shapes.
pub type Entity = Map<String, Value>;

/// Reads `_id` off an entity, if present.
pub fn id_of(entity: &Entity) -> Option<&str> {
    entity.get("_id").and_then(Value::as_str)
}

/// Reads `_kmd.local`, defaulting to `false` when `_kmd` or the flag is absent.
pub fn is_local(entity: &Entity) -> bool {
    entity
        .get("_kmd")
        .and_then(Value::as_object)
        .and_then(|kmd| kmd.get("local"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Stamps `_kmd.local = true` on an entity, creating `_kmd` if absent.
pub fn mark_local(entity: &mut Entity) {
    let kmd = entity
        .entry("_kmd".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(kmd) = kmd {
        kmd.insert("local".to_string(), Value::Bool(true));
    }
}

/// Strips the locally-minted `_id` and `_kmd.local` marker before a Create push (§4.7).
pub fn strip_local_markers(entity: &mut Entity) {
    entity.remove("_id");
    if let Some(Value::Object(kmd)) = entity.get_mut("_kmd") {
        kmd.remove("local");
    }
}

/// Mints a 24-character hex id in the same shape as a server-assigned id
/// (4-byte timestamp || 5 random bytes || 3-byte counter, mirroring a Mongo
/// ObjectId's layout so locally-minted and server ids are visually indistinguishable).
pub fn generate_local_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let mut bytes = [0u8; 12];
    let ts = chrono::Utc::now().timestamp() as u32;
    bytes[0..4].copy_from_slice(&ts.to_be_bytes());

    let mut random = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut random);
    bytes[4..9].copy_from_slice(&random);

    let counter = COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes();
    bytes[9..12].copy_from_slice(&counter[1..4]);

    hex::encode(bytes)
}

/// Ensures the entity has an `_id`, minting one and stamping `_kmd.local` if missing.
pub fn ensure_id_and_stamp(entity: &mut Entity) {
    if id_of(entity).is_none() {
        entity.insert("_id".to_string(), Value::String(generate_local_id()));
        mark_local(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_24_char_hex_ids() {
        let id = generate_local_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_ids_under_rapid_generation() {
        let a = generate_local_id();
        let b = generate_local_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ensure_id_and_stamp_marks_local_only_when_minted() {
        let mut e = Entity::new();
        ensure_id_and_stamp(&mut e);
        assert!(id_of(&e).is_some());
        assert!(is_local(&e));

        let mut e2 = Entity::new();
        e2.insert("_id".into(), Value::String("srv1".into()));
        ensure_id_and_stamp(&mut e2);
        assert!(!is_local(&e2));
    }

    #[test]
    fn strip_local_markers_removes_id_and_flag() {
        let mut e = Entity::new();
        ensure_id_and_stamp(&mut e);
        strip_local_markers(&mut e);
        assert!(id_of(&e).is_none());
        assert!(!is_local(&e));
    }
}
