//! Persistence: attachment files, message records, and the mailroom that
//! ties them to the MIME decomposer.

pub mod attachments;
pub mod mailroom;
pub mod records;
