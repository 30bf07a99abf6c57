// tests/property/fanout_test.rs

//! Every registered subscriber sees every publish exactly once, whatever the
//! interleaving of subscriptions and removals.

use cableway::core::pubsub::{Broadcaster, Delivery, StreamOwner};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
enum Op {
    Add(u64),
    Remove(u64),
    Publish,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..8).prop_map(Op::Add),
        (0u64..8).prop_map(Op::Remove),
        Just(Op::Publish),
    ]
}

proptest! {
    #[test]
    fn test_publish_counts_match_the_live_set(ops in prop::collection::vec(op(), 1..80)) {
        let streams = Broadcaster::new();
        let received: Vec<Arc<AtomicUsize>> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut expected = [0usize; 8];
        let mut live = BTreeSet::new();

        for op in ops {
            match op {
                Op::Add(id) => {
                    let counter = received[id as usize].clone();
                    let deliver: Delivery = Arc::new(move |_payload: Arc<Value>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    streams.add(StreamOwner::new(id, "sub"), "topic", deliver);
                    live.insert(id);
                }
                Op::Remove(id) => {
                    let removed = streams.remove(&StreamOwner::new(id, "sub"), "topic");
                    prop_assert_eq!(removed, live.remove(&id));
                }
                Op::Publish => {
                    let scheduled = streams.publish("topic", json!(null));
                    prop_assert_eq!(scheduled, live.len());
                    for id in &live {
                        expected[*id as usize] += 1;
                    }
                }
            }
        }

        for (id, counter) in received.iter().enumerate() {
            prop_assert_eq!(counter.load(Ordering::SeqCst), expected[id]);
        }
        prop_assert_eq!(streams.is_empty(), live.is_empty());
    }
}
