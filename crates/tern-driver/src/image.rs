//! Publication images.
//!
//! An image is the driver-side record of a remote producer's session as
//! observed through a receive channel endpoint: its mapped log, high-water
//! and consumption counters, and the position counter of every subscriber
//! reading it. The external receiver injects creation events and keeps the
//! activity clock fresh; the conductor owns the lifecycle.

use tern_logbuffer::MappedRawLog;
use tern_primitives::CountersManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Active,
    Inactive,
    Linger,
    Done,
}

/// Position counter of one subscriber on one image.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberPosition {
    pub subscription_registration_id: i64,
    pub counter_id: i32,
}

pub struct PublicationImage {
    /// Registration id assigned when the conductor created the image; also
    /// names the log file and correlates availability events.
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub endpoint_registration_id: i64,
    pub log: MappedRawLog,
    pub initial_term_id: i32,
    pub rcv_hwm_counter_id: i32,
    pub rcv_pos_counter_id: i32,
    pub source_identity: String,
    pub subscriber_positions: Vec<SubscriberPosition>,
    pub state: ImageState,
    pub time_of_last_state_change_ns: i64,
    /// Refreshed by the receiver on every status update.
    pub time_of_last_activity_ns: i64,
    pub liveness_timeout_ns: i64,
    pub is_end_of_stream: bool,
}

impl PublicationImage {
    /// High-water mark published by the receiver.
    pub fn rcv_hwm(&self, counters: &CountersManager) -> i64 {
        counters.get_value(self.rcv_hwm_counter_id)
    }

    /// True when every subscriber has consumed up to the high-water mark.
    pub fn is_drained(&self, counters: &CountersManager) -> bool {
        let hwm = self.rcv_hwm(counters);
        self.subscriber_positions
            .iter()
            .all(|sp| counters.get_value(sp.counter_id) >= hwm)
    }

    pub fn remove_subscriber(&mut self, subscription_registration_id: i64) -> Option<SubscriberPosition> {
        let index = self
            .subscriber_positions
            .iter()
            .position(|sp| sp.subscription_registration_id == subscription_registration_id)?;
        Some(self.subscriber_positions.swap_remove(index))
    }

    /// Advance the lifecycle. Returns `Some(true)` exactly once, at the
    /// transition into linger, when unavailability must be broadcast;
    /// `None` until then; the caller tests [`ImageState::Done`] for
    /// deletion.
    pub fn on_time_event(&mut self, now_ns: i64, counters: &CountersManager) -> Option<bool> {
        match self.state {
            ImageState::Active => {
                if self.is_end_of_stream
                    || now_ns - self.time_of_last_activity_ns > self.liveness_timeout_ns
                {
                    self.state = ImageState::Inactive;
                    self.time_of_last_state_change_ns = now_ns;
                }
                None
            }
            ImageState::Inactive => {
                if self.is_drained(counters)
                    || now_ns - self.time_of_last_state_change_ns > self.liveness_timeout_ns
                {
                    self.state = ImageState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                    return Some(true);
                }
                None
            }
            ImageState::Linger => {
                if now_ns - self.time_of_last_state_change_ns > self.liveness_timeout_ns {
                    self.state = ImageState::Done;
                }
                None
            }
            ImageState::Done => None,
        }
    }
}
