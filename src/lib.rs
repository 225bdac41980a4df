#![deny(missing_docs)]

//! This crate bridges line oriented serial devices onto the network.
//!
//! Each configured serial device is handled by a [`link`], which keeps (re)opening the device
//! for as long as the process lives.
//! The lines read from all links are merged into a single stream of [`message::Message`]s.
//!
//! That stream may be teed into a rotating log file by the [`archiver`],
//! which moves full files into an archive directory.
//!
//! The stream is then fanned out to any combination of sinks:
//! a TCP [`server`] broadcasting to its clients, a [`udp`] sender and a pub/sub [`broker`].
//! Lines received from the broker may be written back to one writable link.
//!
//! The [`dispatcher`] wires all of this together and owns shutdown.
//! Nothing is acknowledged or persisted beyond the log files, delivery is best effort.

/// Rotating tee logger.
pub mod archiver;

/// Pub/sub broker bridge.
pub mod broker;

/// The command line interface.
pub mod cli;

/// Configuration files.
pub mod config;

/// Wires everything together.
pub mod dispatcher;

/// Possible errors in this library.
pub mod error;

/// Reconnecting serial devices.
pub mod link;

/// Masking one device's data unless another device corroborates it.
pub mod liveness;

/// Logging setup.
pub mod logging;

/// What flows through the gateway.
pub mod message;

/// Mock serial devices, for testing.
pub mod mock;

mod peer;

/// Serial port related code.
pub mod serial;

/// The TCP broadcast server.
pub mod server;

/// The UDP sink.
pub mod udp;
