//! Boundary normalization shared by the HTTP client and the realtime
//! channel: envelope unwrapping and entity identity extraction. Both code
//! paths get identical semantics by going through these two functions.

use serde_json::Value;

/// Dedupe key of an entity referenced in an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdKey {
    Int(i64),
    Str(String),
}

/// Identity field names in lookup order. Backends alias the id field per
/// entity kind, so the key is the first non-null one present.
const ID_FIELDS: &[&str] = &[
    "id",
    "commentId",
    "replyId",
    "postId",
    "notificationId",
    "eventId",
];

/// Extract the dedupe key of an entity, if it carries one.
pub fn identity_of(entity: &Value) -> Option<IdKey> {
    let obj = entity.as_object()?;
    for field in ID_FIELDS {
        match obj.get(*field) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(IdKey::Int(i));
                }
            }
            Some(Value::String(s)) => return Some(IdKey::Str(s.clone())),
            _ => {}
        }
    }
    None
}

/// Unwrap `{success, data}` / `{data, message}` envelopes down to the
/// innermost payload. A bare payload comes back unchanged; a wrapper with
/// `data: null` normalizes to `Null`. An object that merely has a `data`
/// field next to other domain fields is not a wrapper.
pub fn unwrap_envelope(raw: Value) -> Value {
    let mut current = raw;
    loop {
        if !is_wrapper(&current) {
            return current;
        }
        match current {
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Null) | None => return Value::Null,
                Some(inner) => current = inner,
            },
            _ => return current,
        }
    }
}

fn is_wrapper(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.contains_key("data")
        && (obj.contains_key("success")
            || obj
                .keys()
                .all(|k| matches!(k.as_str(), "data" | "message" | "timestamp")))
}
