//! Low-latency peer-connection transport (preferred path).

mod capture;
mod client;

pub use capture::AudioCapture;
pub use client::PeerTransport;
