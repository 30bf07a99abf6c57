// tests/integration/mod.rs

pub mod broadcast_test;
pub mod connection_test;
pub mod subscriptions_test;
pub mod test_helpers;
