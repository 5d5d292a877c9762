pub mod envelope;
pub mod error;
pub(crate) mod sweep;
pub(crate) mod transport;
pub(crate) mod watch;
