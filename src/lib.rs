//! Boxcraft - session monitoring and attention routing for coding agents

mod event;
mod session;

pub use event::*;
pub use session::*;

pub mod attention;
pub mod config;
pub mod dispatcher;
pub mod git_status;
pub mod monitor;
pub mod tracker;
