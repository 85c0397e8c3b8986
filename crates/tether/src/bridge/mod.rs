//! IPC bridge between a sub-process and its parent.
//!
//! This module provides the wire protocol, framing codec and the local socket
//! transport used by [`LocalChannel`](crate::channel::LocalChannel).
//!
//! # Architecture
//!
//! - **protocol**: Message envelope, message types, process identity
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: local socket endpoint and [`Transport`](crate::channel::Transport) impl

pub mod codec;
pub mod protocol;
pub mod transport;
