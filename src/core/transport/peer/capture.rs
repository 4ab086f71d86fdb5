use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::transport::base::TransportResult;

/// External microphone feeding the peer transport's local audio track.
///
/// Device access lives outside this crate; implementations hand back a
/// channel of 16kHz mono PCM16 frames (20ms frames are typical).
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Start producing frames.
    async fn start(&self) -> TransportResult<mpsc::Receiver<Bytes>>;

    /// Stop producing frames. The receiver handed out by `start` may close.
    async fn stop(&self);
}
