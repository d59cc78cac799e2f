//! Local IPC layer for `interaction-relay-ctl`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line operator commands.

pub mod server;
