//! Integration test entry point for fleet-node.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod membership;
mod messaging;
mod services;
mod templates;
