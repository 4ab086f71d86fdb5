//! Streaming WebSocket transport (fallback path).

mod client;

pub use client::StreamTransport;
