//! hostscope - discover running agent hosts and aggregate their session status
//!
//! This library crate exposes internal modules for integration testing.

pub mod config;
pub mod data;
pub mod discovery;
pub mod status;
