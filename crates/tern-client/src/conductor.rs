//! Client conductor: the broadcast-consuming half of the client.
//!
//! Commands are fire-and-forget into the ring; this conductor collects the
//! correlated responses, resolves pending registrations, and routes image
//! availability into the owning subscriptions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use tern_logbuffer::MappedRawLog;
use tern_primitives::{BroadcastReceiver, CountersReader};
use tern_protocol::response::{
    type_id as rsp, ClientTimeout, CounterUpdate, ErrorCode, ErrorResponse, ImageMessage,
    ImageReady, OperationSucceeded, PublicationReady, SubscriptionReady,
};

use crate::image::Image;
use crate::subscription::SubscriptionState;

/// Resolution state of one issued command.
pub(crate) enum Registration {
    Error { code: ErrorCode, message: String },
    Publication(PublicationReady),
    ExclusivePublication(PublicationReady),
    Subscription { channel_status_indicator_id: i32 },
    Counter { counter_id: i32 },
    OperationSucceeded,
}

pub(crate) struct ClientConductor {
    rx: BroadcastReceiver,
    counters: Rc<CountersReader>,
    client_id: i64,
    pub(crate) pending: HashMap<i64, Registration>,
    pub(crate) subscriptions: HashMap<i64, Rc<RefCell<SubscriptionState>>>,
    pub(crate) timed_out: bool,
    pub(crate) broadcast_losses: u64,
}

impl ClientConductor {
    pub fn new(rx: BroadcastReceiver, counters: Rc<CountersReader>, client_id: i64) -> Self {
        Self {
            rx,
            counters,
            client_id,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            timed_out: false,
            broadcast_losses: 0,
        }
    }

    /// Drain the broadcast; returns the number of responses processed.
    pub fn process(&mut self) -> usize {
        let mut work_count = 0;

        loop {
            let mut received = None;
            let outcome = self.rx.receive(|msg_type_id, payload| {
                received = Some((msg_type_id, payload.to_vec()));
            });

            match outcome {
                Ok(true) => {
                    if let Some((msg_type_id, payload)) = received {
                        self.on_response(msg_type_id, &payload);
                        work_count += 1;
                    }
                }
                Ok(false) => break,
                Err(loss) => {
                    warn!("broadcast loss: {}", loss);
                    self.broadcast_losses = loss.lapped_count;
                }
            }
        }

        work_count
    }

    fn on_response(&mut self, msg_type_id: i32, payload: &[u8]) {
        match msg_type_id {
            rsp::ON_ERROR => {
                if let Ok(response) = ErrorResponse::decode(payload) {
                    self.pending.insert(
                        response.offending_command_correlation_id,
                        Registration::Error {
                            code: response.error_code,
                            message: response.error_message,
                        },
                    );
                }
            }
            rsp::ON_PUBLICATION_READY => {
                if let Ok(ready) = PublicationReady::decode(payload) {
                    self.pending.insert(ready.correlation_id, Registration::Publication(ready));
                }
            }
            rsp::ON_EXCLUSIVE_PUBLICATION_READY => {
                if let Ok(ready) = PublicationReady::decode(payload) {
                    self.pending
                        .insert(ready.correlation_id, Registration::ExclusivePublication(ready));
                }
            }
            rsp::ON_SUBSCRIPTION_READY => {
                if let Ok(ready) = SubscriptionReady::decode(payload) {
                    if let Some(state) = self.subscriptions.get(&ready.correlation_id) {
                        state.borrow_mut().channel_status_indicator_id = ready.channel_status_indicator_id;
                    }
                    self.pending.insert(
                        ready.correlation_id,
                        Registration::Subscription {
                            channel_status_indicator_id: ready.channel_status_indicator_id,
                        },
                    );
                }
            }
            rsp::ON_AVAILABLE_IMAGE => {
                if let Ok(ready) = ImageReady::decode(payload) {
                    self.on_available_image(ready);
                }
            }
            rsp::ON_UNAVAILABLE_IMAGE => {
                if let Ok(message) = ImageMessage::decode(payload) {
                    if let Some(state) = self.subscriptions.get(&message.subscription_registration_id) {
                        state
                            .borrow_mut()
                            .images
                            .retain(|image| image.correlation_id() != message.correlation_id);
                    }
                }
            }
            rsp::ON_OPERATION_SUCCESS => {
                if let Ok(response) = OperationSucceeded::decode(payload) {
                    self.pending.insert(response.correlation_id, Registration::OperationSucceeded);
                }
            }
            rsp::ON_COUNTER_READY => {
                if let Ok(update) = CounterUpdate::decode(payload) {
                    self.pending
                        .insert(update.correlation_id, Registration::Counter { counter_id: update.counter_id });
                }
            }
            rsp::ON_UNAVAILABLE_COUNTER => {
                // Informational; the owner already initiated the removal
                // or has timed out.
            }
            rsp::ON_CLIENT_TIMEOUT => {
                if let Ok(timeout) = ClientTimeout::decode(payload) {
                    if timeout.client_id == self.client_id {
                        warn!("this client was timed out by the driver");
                        self.timed_out = true;
                    }
                }
            }
            other => {
                debug!("unknown response type id: {}", other);
            }
        }
    }

    fn on_available_image(&mut self, ready: ImageReady) {
        let Some(state) = self.subscriptions.get(&ready.subscriber_registration_id) else {
            return;
        };

        let log = match MappedRawLog::map_existing(Path::new(&ready.log_file)) {
            Ok(log) => log,
            Err(e) => {
                warn!("could not map image log {}: {}", ready.log_file, e);
                return;
            }
        };

        let mut state = state.borrow_mut();
        if state.images.iter().any(|i| i.correlation_id() == ready.correlation_id) {
            return;
        }

        debug!("image {} available on subscription {}", ready.correlation_id, state.registration_id);
        state.images.push(Image {
            correlation_id: ready.correlation_id,
            session_id: ready.session_id,
            source_identity: ready.source_identity,
            log,
            counters: self.counters.clone(),
            subscriber_position_id: ready.subscriber_position_id,
            is_closed: false,
        });
    }
}
