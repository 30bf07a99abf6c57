// tests/property/buffer_test.rs

//! The pre-ready buffer never reorders, drops or duplicates frames.

use cableway::core::transport::{Frame, MessageBuffer};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_dispatch_order_matches_arrival_order(
        frames in prop::collection::vec(".{0,40}", 0..64),
        ready_at in 0usize..64,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let buffer = MessageBuffer::new(64, move |text| sink.lock().push(text));

        for (i, frame) in frames.iter().enumerate() {
            if i == ready_at {
                buffer.mark_ready();
            }
            buffer.append(Frame::Text(frame.clone())).unwrap();
        }
        buffer.mark_ready();

        prop_assert_eq!(&*seen.lock(), &frames);
        prop_assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_overflow_keeps_the_first_frames(capacity in 1usize..16, extra in 1usize..8) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let buffer = MessageBuffer::new(capacity, move |text| sink.lock().push(text));

        let frames: Vec<String> = (0..capacity + extra).map(|i| i.to_string()).collect();
        let mut rejected = 0;
        for frame in &frames {
            if buffer.append(Frame::Text(frame.clone())).is_err() {
                rejected += 1;
            }
        }
        buffer.mark_ready();

        prop_assert_eq!(rejected, extra);
        prop_assert_eq!(&*seen.lock(), &frames[..capacity].to_vec());
    }
}
