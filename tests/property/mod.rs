// tests/property/mod.rs

//! Property-based tests for Cableway

pub mod buffer_test;
pub mod fanout_test;
pub mod identifier_test;
