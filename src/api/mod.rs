//! Purpose: Define the stable public Rust API boundary for Filepipe.
//! Exports: Pipe, Group, their configuration, events, and error types.
//! Role: Public, additive-only surface; hides internal transport modules.
//! Invariants: This module is the only public path to the pipe engine.
//! Invariants: Transport, sweeper, and watch internals stay private.

mod group;
mod pipe;

pub use crate::core::envelope::{Address, DEFAULT_CHANNEL, Envelope};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::transport::default_root;
pub use group::Group;
pub use pipe::{ChangeEvent, Pipe, PipeConfig};
