//! Engine internals: configuration, connection lifecycle, wire protocol,
//! transfer pipeline.

pub mod config;
pub mod connection;
pub mod pipeline;
pub mod protocol;
