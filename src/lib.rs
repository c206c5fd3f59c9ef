//! Stream quality scheduling and scoring engine for IPTV media proxies.
//!
//! Continuously evaluates the technical quality of the streams assigned to
//! channels in an external media proxy and reorders each channel's streams
//! so the best-performing one plays first.

pub mod api_client;
pub mod checker;
pub mod config;
pub mod errors;
pub mod models;
pub mod probe;
pub mod scoring;
