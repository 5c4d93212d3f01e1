#![forbid(unsafe_code)]

//! Core of the TubeVault download service: job orchestration, live progress
//! fan-out and the on-disk metadata library.

pub mod config;
pub mod error;
pub mod error_log;
pub mod extractor;
pub mod hub;
pub mod jobs;
pub mod library;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod security;
