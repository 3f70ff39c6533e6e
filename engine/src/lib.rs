//! Waypoint Engine Library
//!
//! This library provides the core functionality of the waypoint step
//! executor. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Scheduler signature verification
pub mod crypto;

/// Database persistence module
pub mod db;

/// Agent step body
pub mod agent;

/// Step executor and human-in-the-loop gate
pub mod executor;

/// Continuation scheduler clients
pub mod scheduler;

/// Operation management on top of the executor
pub mod service;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
