//! # dialog-core
//!
//! A dialog-tracking subsystem for a SIP proxy: it follows a call's
//! lifecycle across provisional replies, the final answer, the ACK and
//! eventual teardown, without itself parsing SIP messages, retransmitting,
//! or owning a transport. Those concerns belong to the collaborators
//! described in [`external`].

pub mod callback;
pub mod config;
pub mod dialog;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod external;
pub mod maintenance;
pub mod persist;
pub mod profile;
pub mod rpc;
pub mod state;
pub mod table;
pub mod timer;
pub mod vars;

pub use config::Config;
pub use dialog::Dialog;
pub use engine::DialogEngine;
pub use error::{Error, Result};
pub use state::{DialogEvent, DialogState, EndReason};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
