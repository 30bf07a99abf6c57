// tests/property/identifier_test.rs

//! Subscription keys depend on identifier content, not on field order or encoding.

use cableway::core::protocol::ChannelIdentifier;
use proptest::prelude::*;
use serde_json::{Map, Value};

proptest! {
    #[test]
    fn test_key_is_order_and_encoding_insensitive(
        channel in "[A-Za-z]{1,12}",
        params in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..6),
    ) {
        let params: Vec<(String, String)> = params
            .into_iter()
            .filter(|(k, _)| k != "channel")
            .collect();

        let mut forward = Map::new();
        forward.insert("channel".into(), Value::String(channel.clone()));
        for (k, v) in &params {
            forward.insert(k.clone(), Value::String(v.clone()));
        }
        let mut backward = Map::new();
        for (k, v) in params.iter().rev() {
            backward.insert(k.clone(), Value::String(v.clone()));
        }
        backward.insert("channel".into(), Value::String(channel.clone()));

        let as_object = ChannelIdentifier::decode(&Value::Object(forward.clone())).unwrap();
        let as_string =
            ChannelIdentifier::decode(&Value::String(Value::Object(backward).to_string())).unwrap();

        prop_assert_eq!(as_object.key(), as_string.key());
        prop_assert_eq!(as_object.channel(), channel.as_str());
        prop_assert_eq!(as_string.params().len(), params.len() + 1);
    }
}
