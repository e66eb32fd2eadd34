//! Ember server library.
//!
//! This library exposes the server components for testing.

pub mod config;
pub mod embedding;
pub mod health;
pub mod http;
pub mod metrics;
pub mod node;
