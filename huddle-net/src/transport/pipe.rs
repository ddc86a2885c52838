//! In-process transport pair.
//!
//! Two connected endpoints backed by unbounded channels. Closing one
//! end makes the other end's `recv` resolve with `Closed`, mirroring a
//! dropped socket. The tapped variant copies every frame sent by the
//! first endpoint to an observer, which lets tests inspect exactly what
//! crosses the wire.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

/// One end of an in-process duplex pipe.
pub struct PipeTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    tap: Option<mpsc::UnboundedSender<Vec<u8>>>,
    open: AtomicBool,
}

impl PipeTransport {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self::endpoint(a_tx, a_rx, None),
            Self::endpoint(b_tx, b_rx, None),
        )
    }

    /// Create a connected pair whose first endpoint copies every frame
    /// it sends to the returned observer.
    pub fn pair_tapped() -> (
        PipeTransport,
        PipeTransport,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        (
            Self::endpoint(a_tx, a_rx, Some(tap_tx)),
            Self::endpoint(b_tx, b_rx, None),
            tap_rx,
        )
    }

    fn endpoint(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        tap: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            tap,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let sender = self
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)?;
        sender
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)?;
        if let Some(tap) = &self.tap {
            let _ = tap.send(data.to_vec());
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender ends the peer's recv loop.
        self.tx.lock().unwrap().take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
