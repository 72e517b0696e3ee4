//! Coinpusher backend library
//!
//! Exposes the pipeline pieces for the server binary and integration tests.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod drift;
pub mod model;
pub mod models;
pub mod pipeline;
pub mod stream;
