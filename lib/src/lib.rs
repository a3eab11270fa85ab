//! # Container firmware upgrades
//!
//! This crate lets a CPE device image running as a container take firmware
//! upgrades through its native upgrade tooling. The upgrade hooks persist
//! the image instead of writing flash; the process-1 wrapper applies it
//! early on the next container start.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod apply;
pub mod boot;
pub mod cli;
pub mod config;
mod debuglog;
pub mod envfile;
pub mod error;
pub mod extract;
pub mod hooks;
pub mod install;
pub mod layout;
pub mod marker;
pub mod netid;
pub mod partition;
pub mod snapshot;
mod status;
pub mod store;
mod task;

pub use debuglog::DebugLog;
pub use status::{get_status, UpgradeStatus};
