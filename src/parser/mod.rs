//! Email parsing: header block handling and MIME decomposition.

pub mod header;
pub mod mime;
