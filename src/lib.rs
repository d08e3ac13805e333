//! `mailcatch` — a local SMTP sink.
//!
//! This crate provides the core library for accepting messages over SMTP,
//! splitting them into body text and attachment files, and keeping a
//! record of every message for later inspection.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod smtp;
pub mod store;
