//! Library surface of the segmint HTTP server.
//!
//! The binary in `main.rs` is a thin wrapper; exposing the router here lets
//! integration tests and embedders drive the full HTTP surface without a
//! socket.

pub mod server;
