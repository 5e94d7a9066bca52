//! Client-facing cache protocol

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::{CacheHandler, Outcome, ServerStats};
pub use protocol::{Command, ParseError, Parser};
pub use server::{serve_session, CacheServer};
