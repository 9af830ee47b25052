//! Shared error types for the roomsync client engine.
//!
//! Every crate in the workspace reports failures through [`Error`] and the
//! [`Result`] alias defined here.

pub mod error;

pub use error::{Error, Result};
