//! # Build Migrator Library
//!
//! This library exposes the command line layer for testing and integration.
//!
//! The main binary uses these modules through the `main.rs` entry point.

pub mod cli;

// Re-export migrator_core for convenience
pub use migrator_core;
