use std::sync::Arc;

use serde_json::{json, Map, Value};

use wattpilot::auth::{self, AuthMethod};
use wattpilot::messages::{self, FullStatus, Message};
use wattpilot::store::{split_children, PropertyStore};
use wattpilot::{AuthError, PropertyError, Schema};

const SERIAL: &str = "12345678";

// Reference vectors computed with the original protocol implementation.
const PBKDF2_SECRET: &[u8] = b"gK7ZMRVzHHysF8s75TgK4Ry4vvl9AO3f";

#[test]
fn pbkdf2_secret_matches_reference_vector() {
    let secret = auth::derive_secret("password123", SERIAL, AuthMethod::Pbkdf2).unwrap();
    assert_eq!(secret, PBKDF2_SECRET);
}

#[test]
fn pbkdf2_secret_varies_with_password_and_serial() {
    let base = auth::derive_secret("password123", SERIAL, AuthMethod::Pbkdf2).unwrap();
    let other_password = auth::derive_secret("password124", SERIAL, AuthMethod::Pbkdf2).unwrap();
    let other_serial = auth::derive_secret("password123", "87654321", AuthMethod::Pbkdf2).unwrap();
    assert_ne!(base, other_password);
    assert_ne!(base, other_serial);
    assert_eq!(base.len(), 32);
}

#[test]
fn auth_response_matches_reference_vector() {
    let response = auth::auth_response(
        &"a".repeat(32),
        &"b".repeat(32),
        &"c".repeat(32),
        PBKDF2_SECRET,
    );
    assert_eq!(
        response,
        "6bbb36e853a79323ac9e6d9aad7edc45097b33eccf484642d97123e8ce0b379c"
    );
}

#[test]
fn auth_response_matches_second_reference_vector() {
    let secret = auth::derive_secret("secret", "WP123", AuthMethod::Pbkdf2).unwrap();
    assert_eq!(secret, b"YB6t52XLylBlypOMOCzuBvWipa23IYDw");
    let response = auth::auth_response("a", "b", &"c".repeat(32), &secret);
    assert_eq!(
        response,
        "c274aff1745733c97b6ed6d834d88bff9f2a5482a087f160ea750204f48281d5"
    );
}

#[test]
fn auth_response_is_order_sensitive() {
    let straight = auth::auth_response("t1", "t2", "t3", b"pw");
    let swapped = auth::auth_response("t2", "t1", "t3", b"pw");
    assert_ne!(straight, swapped);
}

#[test]
fn bcrypt_secret_is_deterministic_and_serial_bound() {
    let one = auth::derive_secret("password", SERIAL, AuthMethod::Bcrypt).unwrap();
    let two = auth::derive_secret("password", SERIAL, AuthMethod::Bcrypt).unwrap();
    let other = auth::derive_secret("password", "87654321", AuthMethod::Bcrypt).unwrap();
    assert_eq!(one, two);
    assert_ne!(one, other);
    // bcrypt-base64 of the 23 digest bytes the string form carries
    assert_eq!(one.len(), 31);
}

#[test]
fn bcrypt_requires_a_numeric_serial() {
    assert!(matches!(
        auth::derive_secret("password", "WPX123", AuthMethod::Bcrypt),
        Err(AuthError::BadSerial(_))
    ));
}

#[test]
fn hmac_signature_matches_reference_vector() {
    let payload = r#"{"type":"setValue","requestId":7,"key":"amp","value":16}"#;
    let signature = auth::sign_payload(payload.as_bytes(), PBKDF2_SECRET);
    assert_eq!(
        signature,
        "8f50023c88cf06c8ec2ebadcafbd3bfdd9f3db7c99e93f3e05276d24f1da0193"
    );
}

#[test]
fn generated_tokens_are_32_hex_chars() {
    let one = auth::generate_token();
    let two = auth::generate_token();
    assert_eq!(one.len(), 32);
    assert!(one.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_ne!(one, two);
}

#[test]
fn auth_method_parses_wire_identifiers() {
    assert_eq!(AuthMethod::from_wire("pbkdf2").unwrap(), AuthMethod::Pbkdf2);
    assert_eq!(AuthMethod::from_wire("bcrypt").unwrap(), AuthMethod::Bcrypt);
    assert!(matches!(
        AuthMethod::from_wire("scrypt"),
        Err(AuthError::UnsupportedAlgorithm(_))
    ));
}

// ---- Wire codec ----

#[test]
fn decode_greeting() {
    let inbound = messages::decode(
        r#"{"type":"hello","serial":"WP123","hostname":"wattpilot-home","secured":1}"#,
    )
    .unwrap();
    match inbound.message {
        Some(Message::Hello(hello)) => {
            assert_eq!(hello.serial, "WP123");
            assert_eq!(hello.hostname.as_deref(), Some("wattpilot-home"));
            assert_eq!(hello.secured, Some(1));
        }
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn unknown_message_type_preserves_raw_frame() {
    let inbound = messages::decode(r#"{"type":"updateInverter","id":4}"#).unwrap();
    assert!(inbound.message.is_none());
    assert_eq!(inbound.raw["id"], json!(4));
}

#[test]
fn malformed_frame_is_an_error() {
    assert!(messages::decode("{not json").is_err());
}

#[test]
fn set_value_round_trips() {
    let message = Message::SetValue {
        request_id: 3,
        key: "amp".to_string(),
        value: json!(16),
    };
    let text = messages::encode(&message).unwrap();
    let decoded = messages::decode(&text).unwrap();
    match decoded.message {
        Some(Message::SetValue {
            request_id,
            key,
            value,
        }) => {
            assert_eq!(request_id, 3);
            assert_eq!(key, "amp");
            assert_eq!(value, json!(16));
        }
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn secured_envelope_embeds_counter_and_signature() {
    let inner = messages::encode(&Message::SetValue {
        request_id: 7,
        key: "amp".to_string(),
        value: json!(16),
    })
    .unwrap();
    let envelope = messages::secured_envelope(inner.clone(), 7, b"key-bytes");
    match envelope {
        Message::SecuredMsg(secured) => {
            assert_eq!(secured.request_id, "7sm");
            assert_eq!(secured.data, inner);
            assert_eq!(secured.hmac, auth::sign_payload(inner.as_bytes(), b"key-bytes"));
        }
        other => panic!("unexpected envelope: {other:?}"),
    }
}

#[test]
fn full_status_completion_markers() {
    let frame = |partial, index, count| FullStatus {
        partial,
        batch_index: index,
        batch_count: count,
        status: Map::new(),
    };
    assert!(!frame(None, Some(0), Some(2)).completes_batch());
    assert!(frame(None, Some(1), Some(2)).completes_batch());
    assert!(!frame(Some(true), None, None).completes_batch());
    assert!(frame(Some(false), None, None).completes_batch());
    assert!(frame(None, None, None).completes_batch());
}

// ---- Coercion ----

#[test]
fn coercion_round_trips_scalar_types() {
    let schema = Schema::builtin();
    assert_eq!(schema.coerce("amp", json!("16")).unwrap(), json!(16));
    assert_eq!(schema.coerce("amp", json!(6.9)).unwrap(), json!(6));
    assert_eq!(schema.coerce("amp", json!(true)).unwrap(), json!(1));
    assert_eq!(schema.coerce("esk", json!("true")).unwrap(), json!(true));
    assert_eq!(schema.coerce("esk", json!("True")).unwrap(), json!(true));
    assert_eq!(schema.coerce("esk", json!("0")).unwrap(), json!(false));
    assert_eq!(schema.coerce("fte", json!("7.5")).unwrap(), json!(7.5));
    assert_eq!(schema.coerce("fte", json!(3)).unwrap(), json!(3.0));
    assert_eq!(schema.coerce("oct", json!(40)).unwrap(), json!("40"));
}

#[test]
fn uncoercible_values_are_property_errors() {
    let schema = Schema::builtin();
    assert!(matches!(
        schema.coerce("amp", json!("sixteen")),
        Err(PropertyError::Uncoercible { .. })
    ));
    assert!(matches!(
        schema.coerce("esk", json!("maybe")),
        Err(PropertyError::Uncoercible { .. })
    ));
    assert!(matches!(
        schema.coerce("fte", json!([1])),
        Err(PropertyError::Uncoercible { .. })
    ));
}

#[test]
fn unknown_keys_pass_through_coercion() {
    let schema = Schema::builtin();
    let value = json!({"nested": [1, 2]});
    assert_eq!(schema.coerce("zzz", value.clone()).unwrap(), value);
}

#[test]
fn value_maps_label_known_values() {
    let schema = Schema::builtin();
    assert_eq!(schema.label("lmo", &json!(4)), Some("Eco"));
    assert_eq!(schema.label("car", &json!(2)), Some("Charging"));
    assert_eq!(schema.label("lmo", &json!(99)), None);
    assert_eq!(schema.label("amp", &json!(16)), None);
}

// ---- Property store ----

fn store() -> PropertyStore {
    PropertyStore::new(Arc::new(Schema::builtin()), true)
}

fn status(value: Value) -> Map<String, Value> {
    value.as_object().expect("object literal").clone()
}

#[test]
fn deltas_apply_last_wins() {
    let store = store();
    store.apply_full(status(json!({"amp": 6, "lmo": 3})));
    store.mark_initialized();
    store.apply_delta("amp", json!(10));
    store.apply_delta("amp", json!(16));
    assert_eq!(store.get("amp"), Some(json!(16)));
    assert_eq!(store.get("lmo"), Some(json!(3)));
}

#[test]
fn children_track_parent_updates_and_shrinkage() {
    let store = store();
    store.apply_delta("nrg", json!([230.1, 231.2, 232.3]));
    assert_eq!(store.get("nrg_0"), Some(json!(230.1)));
    assert_eq!(store.get("nrg_2"), Some(json!(232.3)));

    store.apply_delta("nrg", json!([240.0]));
    assert_eq!(store.get("nrg_0"), Some(json!(240.0)));
    assert_eq!(store.get("nrg_1"), None);
    assert_eq!(store.get("nrg_2"), None);
}

#[test]
fn object_children_use_field_names() {
    let store = store();
    store.apply_delta("ccw", json!({"ssid": "home", "ip": "10.0.0.7"}));
    assert_eq!(store.get("ccw_ssid"), Some(json!("home")));
    assert_eq!(store.get("ccw_ip"), Some(json!("10.0.0.7")));

    store.apply_delta("ccw", json!({"ssid": "home"}));
    assert_eq!(store.get("ccw_ip"), None);
}

#[test]
fn change_list_covers_parent_and_children() {
    let store = store();
    let changes = store.apply_delta("nrg", json!([1, 2]));
    let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
    assert!(keys.contains(&"nrg"));
    assert!(keys.contains(&"nrg_0"));
    assert!(keys.contains(&"nrg_1"));
}

#[test]
fn unchanged_values_produce_no_change_notifications() {
    let store = store();
    store.apply_delta("amp", json!(16));
    let changes = store.apply_delta("amp", json!(16));
    assert!(changes.is_empty());
}

#[test]
fn unknown_keys_are_stored_verbatim_without_decomposition() {
    let store = store();
    let value = json!({"deep": [1, 2, 3]});
    store.apply_delta("xyz9", value.clone());
    assert_eq!(store.get("xyz9"), Some(value));
    assert_eq!(store.get("xyz9_deep"), None);
}

#[test]
fn all_properties_merges_parents_and_children() {
    let store = store();
    store.apply_full(status(json!({"amp": 16, "pha": [true, false]})));
    let all = store.all_properties();
    assert_eq!(all.get("amp"), Some(&json!(16)));
    assert_eq!(all.get("pha_0"), Some(&json!(true)));
    assert_eq!(all.get("pha_1"), Some(&json!(false)));
}

#[test]
fn split_children_is_pure_and_deterministic() {
    let derived = split_children("pha", &json!([true, false]));
    assert_eq!(
        derived,
        vec![
            ("pha_0".to_string(), json!(true)),
            ("pha_1".to_string(), json!(false)),
        ]
    );
    assert!(split_children("amp", &json!(16)).is_empty());
}
