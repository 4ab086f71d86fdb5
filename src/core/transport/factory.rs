use std::sync::Arc;

use super::base::{Transport, TransportError, TransportOptions, TransportResult, TransportType};
use super::peer::{AudioCapture, PeerTransport};
use super::stream::StreamTransport;

/// Creates transports by kind.
///
/// Managers go through a factory so tests can substitute scripted transports.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportType) -> TransportResult<Arc<dyn Transport>>;
}

/// Factory over the two real implementations.
#[derive(Clone)]
pub struct DefaultTransportFactory {
    options: TransportOptions,
    capture: Option<Arc<dyn AudioCapture>>,
}

impl DefaultTransportFactory {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            capture: None,
        }
    }

    /// Feed peer transports from an external capture device.
    pub fn with_capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, kind: TransportType) -> TransportResult<Arc<dyn Transport>> {
        match kind {
            TransportType::Peer => {
                let mut transport = PeerTransport::new(self.options.clone())?;
                if let Some(capture) = &self.capture {
                    transport = transport.with_capture(capture.clone());
                }
                Ok(Arc::new(transport))
            }
            TransportType::Stream => Ok(Arc::new(StreamTransport::new(self.options.clone()))),
            TransportType::None => Err(TransportError::Unsupported(
                "Creating a transport of kind 'none'".to_string(),
            )),
        }
    }
}
