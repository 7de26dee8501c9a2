//! Unit tests module

pub mod store_test;
pub mod types_test;
