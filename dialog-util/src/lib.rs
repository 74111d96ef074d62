#![deny(missing_docs)]
//! Shared utilities used by the `dialog-core` crate.

mod arcstr;

pub use arcstr::*;
