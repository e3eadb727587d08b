//! Wire-level helpers: request fingerprinting and the closed set of
//! recognized subscription stream types.
//!
//! Fingerprinting relies on `serde_json::Value`'s default `Map`
//! implementation being a `BTreeMap` (the `preserve_order` cargo feature is
//! *not* enabled anywhere in this crate's dependency graph), so nested
//! objects already serialize with sorted keys. Serializing is therefore
//! sufficient to get a deterministic, canonical byte encoding without any
//! bespoke key-sorting pass.

use serde_json::Value;

/// The closed set of request keys that identify a subscribable stream.
///
/// Grounded in the original library's `streams_list`; trimmed to the keys
/// named in the distilled specification plus the well-known siblings in the
/// same family (the p2p and cashier channels).
pub const RECOGNIZED_STREAMS: &[&str] = &[
    "balance",
    "candles",
    "cashier_payments",
    "exchange_rates",
    "p2p_advertiser",
    "p2p_order",
    "p2p_order_list",
    "proposal",
    "proposal_array",
    "proposal_open_contract",
    "ticks",
    "ticks_history",
    "transaction",
    "website_status",
];

/// Returns the first recognized stream key present in `request`, if any.
pub fn msg_type(request: &Value) -> Option<&'static str> {
    let obj = request.as_object()?;
    RECOGNIZED_STREAMS.iter().copied().find(|key| obj.contains_key(*key))
}

/// A canonical byte encoding of `request`, used both as the subscription
/// identity key and as the response-cache key.
///
/// Must be called on the request exactly as the caller supplied it -
/// before `req_id` or `subscribe: 1` are injected - so that two calls with
/// identical intent collapse to the same fingerprint regardless of whether
/// one of them happens to be the subscribing call.
pub fn fingerprint(request: &Value) -> Vec<u8> {
    serde_json::to_vec(request).expect("serde_json::Value always serializes")
}

/// True if `request` is a "parent" `proposal_open_contract` subscription:
/// it asks to stream every open contract rather than track one by id, so
/// per-element errors must be delivered as data instead of terminating the
/// stream.
pub fn is_parent_proposal_open_contract(request: &Value) -> bool {
    let Some(obj) = request.as_object() else { return false };
    let wants_poc = obj
        .get("proposal_open_contract")
        .map(|v| is_truthy(v))
        .unwrap_or(false);
    let has_contract_id = obj.get("contract_id").map(|v| is_truthy(v)).unwrap_or(false);
    wants_poc && !has_contract_id
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_order_independent() {
        let a = json!({"ticks": "R_100", "subscribe": 1});
        let b = json!({"subscribe": 1, "ticks": "R_100"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_content() {
        let a = json!({"ticks": "R_100"});
        let b = json!({"ticks": "R_50"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn msg_type_finds_recognized_key() {
        assert_eq!(msg_type(&json!({"ticks": "R_100"})), Some("ticks"));
        assert_eq!(msg_type(&json!({"ping": 1})), None);
    }

    #[test]
    fn parent_poc_detection() {
        assert!(is_parent_proposal_open_contract(&json!({"proposal_open_contract": 1})));
        assert!(!is_parent_proposal_open_contract(
            &json!({"proposal_open_contract": 1, "contract_id": 123})
        ));
        assert!(!is_parent_proposal_open_contract(&json!({"ticks": "R_100"})));
    }
}
