//! Inbound SMTP: command parsing, replies, per-connection sessions and the
//! accept loop.

pub mod command;
pub mod listener;
pub mod reply;
pub mod session;

pub use listener::Listener;
pub use session::{Session, SessionSettings};
