//! Fuzz tests module
//!
//! Property-based testing using proptest.

pub mod session_fuzz;
