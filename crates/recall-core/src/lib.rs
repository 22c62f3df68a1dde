//! Core types and trait definitions for the Recall missed-call recovery
//! queue.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod attempt;
pub mod audit;
pub mod breaker;
pub mod consent;
pub mod deadletter;
pub mod entry;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod policy;
pub mod store;

pub use error::{Error, Result};
