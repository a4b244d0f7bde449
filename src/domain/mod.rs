//! Core domain types and logic: configuration models, canonical listings,
//! change events, the diff engine, circuit breaker, and poll policy.
pub mod breaker;
pub mod diff;
pub mod event;
pub mod hashing;
pub mod listing;
pub mod model;
pub mod poll_policy;
pub mod target;
