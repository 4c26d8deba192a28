//! Procunit Core - Platform-independent supervision of a single child process
//!
//! This crate provides the process unit state machine, its configuration, the
//! log reader and the traits that platform-specific launchers implement.

mod config;
mod error;
mod logs;
mod process;
mod stdio;
mod unit;

pub use config::*;
pub use error::*;
pub use logs::*;
pub use process::*;
pub use stdio::*;
pub use unit::*;
