//! Property-based tests for event fingerprinting.
//!
//! Fingerprints must not depend on key insertion order and must change
//! whenever the type or payload changes.

#![allow(clippy::unwrap_used)]

use eventide_core::{canonical_json, event_hash};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{Map, Value};

/// Deterministic property test configuration for CI stability.
fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 50,
        timeout: 5000, // 5 seconds max
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z0-9 æøåÆØÅ_-]{0,20}").unwrap().prop_map(Value::String),
    ]
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z_][a-zA-Z0-9_]{0,11}").unwrap()
}

/// Nested JSON values up to three levels deep.
fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(key_strategy(), inner, 0..6)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Top-level entries with distinct keys, so a test can rebuild the same
/// object in different insertion orders.
fn entries_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map(key_strategy(), value_strategy(), 1..8)
        .prop_map(|map| map.into_iter().collect())
}

fn object(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key, value);
    }
    Value::Object(map)
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn hash_is_invariant_to_key_order(
        event_type in "[A-Z_]{1,24}",
        entries in entries_strategy(),
    ) {
        let forward = object(entries.clone());
        let reversed = object(entries.into_iter().rev());

        prop_assert_eq!(
            event_hash(&event_type, &forward).unwrap(),
            event_hash(&event_type, &reversed).unwrap()
        );
        prop_assert_eq!(canonical_json(&forward).unwrap(), canonical_json(&reversed).unwrap());
    }

    #[test]
    fn hash_is_stable_across_calls(
        event_type in "[A-Z_]{1,24}",
        entries in entries_strategy(),
    ) {
        let data = object(entries);
        let first = event_hash(&event_type, &data).unwrap();
        let second = event_hash(&event_type, &data).unwrap();

        prop_assert_eq!(first.as_str().len(), 64);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn hash_changes_with_event_type(
        left in "[A-Z]{1,12}",
        right in "[A-Z]{1,12}",
        entries in entries_strategy(),
    ) {
        prop_assume!(left != right);
        let data = object(entries);

        prop_assert_ne!(event_hash(&left, &data).unwrap(), event_hash(&right, &data).unwrap());
    }

    #[test]
    fn hash_changes_with_added_field(
        entries in entries_strategy(),
        extra in leaf_strategy(),
    ) {
        let data = object(entries.clone());
        let mut extended = entries;
        extended.push(("0extra".to_string(), extra));
        let extended = object(extended);

        prop_assert_ne!(event_hash("T", &data).unwrap(), event_hash("T", &extended).unwrap());
    }

    #[test]
    fn canonical_form_parses_back_to_same_value(entries in entries_strategy()) {
        let data = object(entries);
        let canonical = canonical_json(&data).unwrap();
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();

        prop_assert_eq!(reparsed, data);
    }
}
