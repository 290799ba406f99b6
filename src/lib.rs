//! ROUTESCAN: quote orchestration engine for CEX/DEX route pricing.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod pnl;
pub mod engine;
pub mod sources;
pub mod dashboard;
