//! Purpose: Brokerless local IPC message bus over the shared filesystem.
//! Exports: `api` (pipes, groups, configuration, errors) and `core`
//! (addressing and envelope primitives).
//! Role: Library crate; processes on one host exchange typed messages and
//! perform request/response calls with no central daemon.
//! Invariants: Message files are bounded by the retention sweeper, never
//! deleted by readers.
pub mod api;
pub mod core;
