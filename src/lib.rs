//! Dictation Onboarding - per-key async operations for a dictation app's setup flow
//!
//! This library exports the operation engine and the onboarding features built on it.

/// Configuration management
pub mod config;
/// Debounced persistence of rapidly changing values
pub mod debounce;
/// Speech model downloads
pub mod models;
/// Keyed async operations, cancellation and observation
pub mod operation;
/// macOS permission requests and grant polling
pub mod permissions;
/// Deadline-bounded condition polling
pub mod poll;
/// User settings and their debounced storage
pub mod settings;
/// Telemetry and logging
pub mod telemetry;
