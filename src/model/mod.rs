//! Core data model types for received messages and their attachments.

pub mod attachment;
pub mod mail;
