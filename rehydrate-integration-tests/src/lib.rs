//! Integration tests for `rehydrate`
//!
//! This crate contains integration tests that verify the interaction between
//! the core runtime, the in-memory log and the testing utilities.

// This is a test-only crate
#![cfg(test)]
