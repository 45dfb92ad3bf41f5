//! Receiver → conductor event injection.
//!
//! External receive workers never touch conductor state directly: they
//! enqueue events that the conductor drains once per duty cycle, on its
//! own thread.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

/// Events injected into the conductor by external workers.
#[derive(Debug, Clone)]
pub enum ConductorEvent {
    /// A receiver observed a new session on a subscribed stream.
    CreatePublicationImage {
        endpoint_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: usize,
        mtu_length: usize,
        source_identity: String,
    },
    /// A receiver saw the producer signal end-of-stream for an image.
    ImageEndOfStream { image_correlation_id: i64 },
    /// A receiver produced fresh status for an image (keeps it alive).
    ImageActivity { image_correlation_id: i64 },
}

/// Handle given to receive workers.
#[derive(Clone)]
pub struct ConductorProxy {
    tx: Sender<ConductorEvent>,
}

impl ConductorProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn on_create_publication_image(
        &self,
        endpoint_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: usize,
        mtu_length: usize,
        source_identity: &str,
    ) {
        let _ = self.tx.send(ConductorEvent::CreatePublicationImage {
            endpoint_registration_id,
            session_id,
            stream_id,
            initial_term_id,
            active_term_id,
            term_offset,
            term_length,
            mtu_length,
            source_identity: source_identity.to_string(),
        });
    }

    pub fn on_image_end_of_stream(&self, image_correlation_id: i64) {
        let _ = self.tx.send(ConductorEvent::ImageEndOfStream { image_correlation_id });
    }

    pub fn on_image_activity(&self, image_correlation_id: i64) {
        let _ = self.tx.send(ConductorEvent::ImageActivity { image_correlation_id });
    }
}

/// Conductor-side receive end.
pub struct ConductorEventQueue {
    rx: Receiver<ConductorEvent>,
}

impl ConductorEventQueue {
    pub fn try_next(&self) -> Option<ConductorEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create the proxy pair.
pub fn conductor_proxy() -> (ConductorProxy, ConductorEventQueue) {
    let (tx, rx) = channel();
    (ConductorProxy { tx }, ConductorEventQueue { rx })
}
