//! kernel-pool daemon library
//!
//! This crate provides the core functionality for the kernel-pool daemon:
//! - Per-owner session lifecycle (creation, reuse, quota, idle eviction)
//! - Execution coordination over the kernel message stream
//! - Pre-flight validation of submitted code
//! - The service facade consumed by the I/O front-end

pub mod config;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod service;
pub mod session;
pub mod validate;
